//! Replay of queued offline calls once the backend is reachable.
//!
//! A pass works on the entries present when it starts. Each entry is replayed
//! at most once per pass and only leaves its queue after the backend confirms
//! the call; failures stay queued as `failed` with the error recorded.

mod http;

pub use http::HttpRpc;

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SyncPolicy;
use crate::error::{Fault, Notice, RpcError};
use crate::losses::LossCounters;
use crate::mirror::{Mirror, Slot};
use crate::queue::{OfflineQueues, QueueClass};

/// Backend transport used to replay a recorded call.
pub trait RpcClient: Send + Sync {
  fn call(&self, method: &str, args: &Value) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

/// Customers first so that invoices referencing them replay cleanly.
const REPLAY_ORDER: [QueueClass; 3] = [QueueClass::Customer, QueueClass::Invoice, QueueClass::Payment];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOutcome {
  /// Every entry in the snapshot was attempted
  Completed,
  /// The pass stopped at the first failure
  Stopped,
  /// Another pass over this queue was already in flight
  AlreadyRunning,
  /// The register is switched to manual offline mode
  Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueReport {
  pub queue: QueueClass,
  pub outcome: QueueOutcome,
  pub attempted: usize,
  pub synced: usize,
  pub failed: usize,
}

impl QueueReport {
  fn new(queue: QueueClass, outcome: QueueOutcome) -> Self {
    Self {
      queue,
      outcome,
      attempted: 0,
      synced: 0,
      failed: 0,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub queues: Vec<QueueReport>,
}

impl SyncReport {
  pub fn synced(&self) -> usize {
    self.queues.iter().map(|q| q.synced).sum()
  }

  pub fn failed(&self) -> usize {
    self.queues.iter().map(|q| q.failed).sum()
  }
}

/// Clears a queue's in-flight flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct Reconciler {
  queues: Arc<OfflineQueues>,
  mirror: Arc<Mirror>,
  losses: Arc<LossCounters>,
  notices: broadcast::Sender<Notice>,
  policy: SyncPolicy,
  running: [AtomicBool; 3],
}

impl Reconciler {
  pub fn new(
    queues: Arc<OfflineQueues>,
    mirror: Arc<Mirror>,
    losses: Arc<LossCounters>,
    notices: broadcast::Sender<Notice>,
    policy: SyncPolicy,
  ) -> Self {
    Self {
      queues,
      mirror,
      losses,
      notices,
      policy,
      running: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
    }
  }

  /// Replay every queue in turn.
  pub async fn sync_all<R: RpcClient>(&self, rpc: &R) -> SyncReport {
    let mut report = SyncReport::default();
    for class in REPLAY_ORDER {
      report.queues.push(self.sync_queue(class, rpc).await);
    }
    report
  }

  /// Replay one queue in FIFO order.
  pub async fn sync_queue<R: RpcClient>(&self, class: QueueClass, rpc: &R) -> QueueReport {
    if self.mirror.get_as::<bool>(Slot::ManualOffline).unwrap_or(false) {
      debug!(queue = %class, "Manual offline mode, not replaying");
      return QueueReport::new(class, QueueOutcome::Offline);
    }

    let flag = &self.running[flag_index(class)];
    if flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!(queue = %class, "Sync pass already running");
      return QueueReport::new(class, QueueOutcome::AlreadyRunning);
    }
    let _guard = PassGuard(flag);

    let mut report = QueueReport::new(class, QueueOutcome::Completed);
    for entry in self.queues.list(class) {
      // Discarded or purged since the snapshot was taken
      if !self.queues.mark_syncing(class, &entry.id) {
        continue;
      }
      report.attempted += 1;

      match rpc.call(&entry.method, &entry.args).await {
        Ok(_) => {
          self.queues.complete(class, &entry.id);
          report.synced += 1;
        }
        Err(e) => {
          self.queues.fail(class, &entry.id, &e.to_string());
          self.losses.record_replay_failure();
          report.failed += 1;

          let fault = Fault::SyncReplayFailure {
            queue: class.to_string(),
            id: entry.id.clone(),
            method: entry.method.clone(),
            reason: e.to_string(),
          };
          warn!("{}", fault);
          let _ = self.notices.send(Notice::now(fault));

          if self.policy == SyncPolicy::Stop {
            report.outcome = QueueOutcome::Stopped;
            break;
          }
        }
      }
    }

    if report.attempted > 0 {
      info!(
        queue = %class,
        synced = report.synced,
        failed = report.failed,
        "Sync pass finished"
      );
    }
    report
  }
}

fn flag_index(class: QueueClass) -> usize {
  match class {
    QueueClass::Invoice => 0,
    QueueClass::Customer => 1,
    QueueClass::Payment => 2,
  }
}
