//! Counters for the bounded-loss paths, so silent drops stay observable.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LossCounters {
  queue_trimmed: AtomicU64,
  serialization_fallbacks: AtomicU64,
  dropped_writes: AtomicU64,
  replay_failures: AtomicU64,
  degraded: AtomicBool,
}

/// Point-in-time copy of [`LossCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LossReport {
  pub queue_trimmed: u64,
  pub serialization_fallbacks: u64,
  pub dropped_writes: u64,
  pub replay_failures: u64,
  pub degraded: bool,
}

impl LossCounters {
  pub fn record_queue_trim(&self, trimmed: usize) {
    self
      .queue_trimmed
      .fetch_add(trimmed as u64, Ordering::Relaxed);
  }

  pub fn record_serialization_fallback(&self) {
    self.serialization_fallbacks.fetch_add(1, Ordering::Relaxed);
  }

  /// A durability write was abandoned; the engine is now degraded.
  pub fn record_dropped_write(&self) {
    self.dropped_writes.fetch_add(1, Ordering::Relaxed);
    self.mark_degraded();
  }

  pub fn record_replay_failure(&self) {
    self.replay_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn mark_degraded(&self) {
    self.degraded.store(true, Ordering::Relaxed);
  }

  pub fn is_degraded(&self) -> bool {
    self.degraded.load(Ordering::Relaxed)
  }

  pub fn snapshot(&self) -> LossReport {
    LossReport {
      queue_trimmed: self.queue_trimmed.load(Ordering::Relaxed),
      serialization_fallbacks: self.serialization_fallbacks.load(Ordering::Relaxed),
      dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
      replay_failures: self.replay_failures.load(Ordering::Relaxed),
      degraded: self.is_degraded(),
    }
  }
}
