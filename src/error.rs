//! Fault taxonomy shared by the store, the queues and the reconciler.
//!
//! Internal plumbing reports through `color_eyre::Report`; the variants here are
//! the ones callers may want to match on, either by downcasting a report or by
//! receiving a [`Notice`].

use chrono::{DateTime, Utc};
use color_eyre::Report;
use thiserror::Error;

/// Faults the engine absorbs at its public boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Fault {
  #[error("persistent store is unavailable")]
  StorageUnavailable,

  #[error("value for '{slot}' is not plain data: {reason}")]
  SerializationFailure { slot: String, reason: String },

  #[error("{queue} queue over capacity, trimmed {trimmed} oldest entries")]
  QueueOverflow { queue: String, trimmed: usize },

  #[error("cache schema version {stored:?} does not match {expected}")]
  VersionMismatch { stored: Option<i64>, expected: i64 },

  #[error("sync failed for {queue} entry {id} ({method}): {reason}")]
  SyncReplayFailure {
    queue: String,
    id: String,
    method: String,
    reason: String,
  },
}

/// Errors returned by an [`RpcClient`](crate::sync::RpcClient) replay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
  #[error("transport error: {0}")]
  Transport(String),

  #[error("backend rejected call with status {status}: {message}")]
  Rejected { status: u16, message: String },

  #[error("backend raised: {0}")]
  Server(String),
}

/// Operator-facing warning published on the engine's notice channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
  pub fault: Fault,
  pub at: DateTime<Utc>,
}

impl Notice {
  pub fn now(fault: Fault) -> Self {
    Self {
      fault,
      at: Utc::now(),
    }
  }
}

/// True when the report was raised because the store is fatally unavailable.
pub fn is_unavailable(report: &Report) -> bool {
  matches!(report.downcast_ref::<Fault>(), Some(Fault::StorageUnavailable))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unavailable_survives_report_conversion() {
    let report: Report = Fault::StorageUnavailable.into();
    assert!(is_unavailable(&report));

    let other = color_eyre::eyre::eyre!("disk full");
    assert!(!is_unavailable(&other));
  }

  #[test]
  fn test_fault_display() {
    let fault = Fault::QueueOverflow {
      queue: "invoice".into(),
      trimmed: 3,
    };
    assert_eq!(
      fault.to_string(),
      "invoice queue over capacity, trimmed 3 oldest entries"
    );
  }
}
