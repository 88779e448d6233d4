//! Write-behind persistence worker.
//!
//! Producers hand `(slot, value)` pairs to a [`WorkerHandle`]; a single consumer
//! task commits them to the persistent store. A slot that already has an
//! unflushed write is overwritten in place (last value wins) instead of queueing
//! a second message, so the channel never holds more than one write per slot.
//! That holds across clears too: a discarded value leaves its message in the
//! channel, and the next write to the slot rides on it.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::slot::Slot;
use crate::cache::PersistentStore;
use crate::config::WorkerConfig;
use crate::error::is_unavailable;
use crate::losses::LossCounters;

enum WorkerMsg {
  Write(Slot),
  Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Pending {
  /// Latest unflushed value per slot
  values: HashMap<Slot, Value>,
  /// Slots with a `Write` message sitting in the channel
  in_channel: HashSet<Slot>,
}

struct Shared {
  pending: Mutex<Pending>,
  /// Held by the worker for each commit and by clears for their whole duration
  commit_lock: tokio::sync::Mutex<()>,
}

impl Shared {
  fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
    self.pending.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Consume the slot's message and whatever value is still attached to it.
  fn take(&self, slot: Slot) -> Option<Value> {
    let mut pending = self.pending();
    pending.in_channel.remove(&slot);
    pending.values.remove(&slot)
  }
}

/// Producer side of the persistence channel.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::Sender<WorkerMsg>,
  shared: Arc<Shared>,
  losses: Arc<LossCounters>,
}

/// Consumer side; run it with [`PersistenceWorker::spawn`].
pub struct PersistenceWorker {
  rx: mpsc::Receiver<WorkerMsg>,
  shared: Arc<Shared>,
  store: Arc<PersistentStore>,
  settings: WorkerConfig,
  losses: Arc<LossCounters>,
}

/// Commits are blocked while this guard is alive.
pub struct CommitPause<'a> {
  _guard: tokio::sync::MutexGuard<'a, ()>,
}

/// Create a connected handle/worker pair.
pub fn channel(
  store: Arc<PersistentStore>,
  settings: WorkerConfig,
  losses: Arc<LossCounters>,
) -> (WorkerHandle, PersistenceWorker) {
  let capacity = Slot::ALL.len() + settings.channel_headroom.max(1);
  let (tx, rx) = mpsc::channel(capacity);
  let shared = Arc::new(Shared {
    pending: Mutex::new(Pending::default()),
    commit_lock: tokio::sync::Mutex::new(()),
  });

  let handle = WorkerHandle {
    tx,
    shared: Arc::clone(&shared),
    losses: Arc::clone(&losses),
  };
  let worker = PersistenceWorker {
    rx,
    shared,
    store,
    settings,
    losses,
  };
  (handle, worker)
}

impl WorkerHandle {
  /// Queue a durability write for `slot`. Never blocks.
  ///
  /// A full channel rejects the write; the rejection is counted as a dropped write.
  pub fn submit(&self, slot: Slot, value: Value) {
    let mut pending = self.shared.pending();
    pending.values.insert(slot, value);
    if pending.in_channel.contains(&slot) {
      // Coalesced into the write that is already queued
      return;
    }

    match self.tx.try_send(WorkerMsg::Write(slot)) {
      Ok(()) => {
        pending.in_channel.insert(slot);
      }
      Err(mpsc::error::TrySendError::Full(_)) => {
        pending.values.remove(&slot);
        self.losses.record_dropped_write();
        warn!(slot = slot.key(), "Persistence channel full, write rejected");
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        pending.values.remove(&slot);
        self.losses.record_dropped_write();
        debug!(slot = slot.key(), "Persistence worker stopped, write dropped");
      }
    }
  }

  /// Number of slots with an unflushed write.
  pub fn queued(&self) -> usize {
    self.shared.pending().values.len()
  }

  /// Wait until every write submitted before this call has been handled.
  pub async fn flush(&self) {
    let (done, wait) = oneshot::channel();
    if self.tx.send(WorkerMsg::Flush(done)).await.is_err() {
      return;
    }
    let _ = wait.await;
  }

  /// Block commits and discard every unflushed write.
  ///
  /// Used by full clears so stale writes cannot land after the wipe. Messages
  /// already in the channel stay there and carry any write made after the clear.
  pub async fn pause(&self) -> CommitPause<'_> {
    let guard = self.shared.commit_lock.lock().await;
    let discarded = {
      let mut pending = self.shared.pending();
      let count = pending.values.len();
      pending.values.clear();
      count
    };
    if discarded > 0 {
      debug!(discarded, "Discarded unflushed writes");
    }
    CommitPause { _guard: guard }
  }
}

impl PersistenceWorker {
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.run())
  }

  pub async fn run(mut self) {
    while let Some(msg) = self.rx.recv().await {
      match msg {
        WorkerMsg::Write(slot) => self.commit(slot).await,
        WorkerMsg::Flush(done) => {
          let _ = done.send(());
        }
      }
    }
    debug!("Persistence worker exiting");
  }

  async fn commit(&self, slot: Slot) {
    let _guard = self.shared.commit_lock.lock().await;
    let Some(value) = self.shared.take(slot) else {
      // Discarded by a clear
      return;
    };

    let data = value.to_string();

    let retries = self.settings.commit_retries;
    let mut delay = self.settings.retry_backoff();
    for attempt in 0..=retries {
      match self
        .store
        .put_raw(slot.destination(), slot.key(), &data)
        .await
      {
        Ok(()) => return,
        Err(e) if is_unavailable(&e) => {
          debug!(slot = slot.key(), "Store unavailable, not retrying");
          break;
        }
        Err(e) => {
          warn!(slot = slot.key(), attempt, "Failed to commit slot: {}", e);
          if attempt < retries {
            tokio::time::sleep(delay).await;
            delay *= 2;
          }
        }
      }
    }

    error!(slot = slot.key(), "Dropping write after exhausting retries");
    self.losses.record_dropped_write();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Table;
  use crate::config::StoreConfig;
  use crate::db::Location;
  use serde_json::json;

  fn memory_store() -> Arc<PersistentStore> {
    Arc::new(PersistentStore::new(Location::Memory, StoreConfig::default()))
  }

  #[tokio::test]
  async fn test_repeated_writes_coalesce() {
    let store = memory_store();
    let losses = Arc::new(LossCounters::default());
    let (handle, worker) = channel(Arc::clone(&store), WorkerConfig::default(), losses);

    for i in 0..100 {
      handle.submit(Slot::PrintTemplate, json!(format!("v{}", i)));
    }
    handle.submit(Slot::TaxInclusive, json!(true));
    assert_eq!(handle.queued(), 2);

    worker.spawn();
    handle.flush().await;

    assert_eq!(handle.queued(), 0);
    assert_eq!(
      store.get_raw(Table::Kv, "print_template").await.unwrap(),
      Some("\"v99\"".to_string())
    );
    assert_eq!(
      store.get_raw(Table::Kv, "tax_inclusive").await.unwrap(),
      Some("true".to_string())
    );
  }

  #[tokio::test]
  async fn test_queue_slots_land_in_queue_table() {
    let store = memory_store();
    let losses = Arc::new(LossCounters::default());
    let (handle, worker) = channel(Arc::clone(&store), WorkerConfig::default(), losses);
    worker.spawn();

    handle.submit(Slot::OfflineInvoices, json!([{"method": "m"}]));
    handle.flush().await;

    assert!(store
      .get_raw(Table::Queues, "offline_invoices")
      .await
      .unwrap()
      .is_some());
    assert!(store
      .get_raw(Table::Kv, "offline_invoices")
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_pause_discards_unflushed_writes() {
    let store = memory_store();
    let losses = Arc::new(LossCounters::default());
    let (handle, worker) = channel(Arc::clone(&store), WorkerConfig::default(), losses);

    handle.submit(Slot::ManualOffline, json!(true));
    {
      let _pause = handle.pause().await;
      assert_eq!(handle.queued(), 0);
    }

    worker.spawn();
    handle.flush().await;
    assert_eq!(store.get_raw(Table::Kv, "manual_offline").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_writes_after_pause_reuse_queued_messages() {
    let store = memory_store();
    let losses = Arc::new(LossCounters::default());
    let (handle, worker) = channel(
      Arc::clone(&store),
      WorkerConfig::default(),
      Arc::clone(&losses),
    );

    // Worker not running yet, so every message is still in the channel
    for slot in Slot::ALL {
      handle.submit(slot, json!("before"));
    }
    drop(handle.pause().await);
    for slot in Slot::ALL {
      handle.submit(slot, json!("after"));
    }
    assert_eq!(handle.queued(), Slot::ALL.len());

    worker.spawn();
    handle.flush().await;

    let report = losses.snapshot();
    assert_eq!(report.dropped_writes, 0);
    assert!(!report.degraded);
    for slot in Slot::ALL {
      assert_eq!(
        store.get_raw(slot.destination(), slot.key()).await.unwrap(),
        Some("\"after\"".to_string()),
        "slot {}",
        slot.key()
      );
    }
  }

  #[tokio::test]
  async fn test_full_channel_rejects_write() {
    let store = memory_store();
    let losses = Arc::new(LossCounters::default());
    let settings = WorkerConfig {
      channel_headroom: 1,
      ..WorkerConfig::default()
    };
    let (handle, _worker) = channel(store, settings, Arc::clone(&losses));

    let slots = Slot::ALL;
    let (last, rest) = slots.split_last().unwrap();
    for slot in rest {
      handle.submit(*slot, json!(1));
    }
    // Two flush requests that never get answered take the remaining capacity
    for _ in 0..2 {
      let waiter = handle.clone();
      tokio::spawn(async move { waiter.flush().await });
    }
    while handle.tx.capacity() > 0 {
      tokio::task::yield_now().await;
    }

    handle.submit(*last, json!(1));

    assert_eq!(handle.queued(), rest.len());
    let report = losses.snapshot();
    assert_eq!(report.dropped_writes, 1);
    assert!(report.degraded);
  }

  #[tokio::test]
  async fn test_commit_error_retries_then_drops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let store = Arc::new(PersistentStore::new(
      Location::File(path.clone()),
      StoreConfig::default(),
    ));
    store.open().await.unwrap();
    rusqlite::Connection::open(&path)
      .unwrap()
      .execute_batch("DROP TABLE kv")
      .unwrap();

    let losses = Arc::new(LossCounters::default());
    let settings = WorkerConfig {
      commit_retries: 2,
      retry_backoff_ms: 1,
      ..WorkerConfig::default()
    };
    let (handle, worker) = channel(Arc::clone(&store), settings, Arc::clone(&losses));
    worker.spawn();

    handle.submit(Slot::PrintTemplate, json!("x"));
    handle.submit(Slot::OfflineInvoices, json!([]));
    handle.flush().await;

    let report = losses.snapshot();
    assert_eq!(report.dropped_writes, 1);
    assert!(report.degraded);
    // A failing statement is not an unavailable store
    assert!(store.is_available());
    assert_eq!(
      store.get_raw(Table::Queues, "offline_invoices").await.unwrap(),
      Some("[]".to_string())
    );
  }

  #[tokio::test]
  async fn test_unavailable_store_drops_and_degrades() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"x").unwrap();
    let store = Arc::new(PersistentStore::new(
      Location::File(blocker.join("cache.db")),
      StoreConfig {
        open_retries: 1,
        health_retries: 0,
        retry_backoff_ms: 1,
      },
    ));
    let losses = Arc::new(LossCounters::default());
    let (handle, worker) = channel(store, WorkerConfig::default(), Arc::clone(&losses));
    worker.spawn();

    handle.submit(Slot::PrintTemplate, json!("x"));
    handle.flush().await;

    let report = losses.snapshot();
    assert_eq!(report.dropped_writes, 1);
    assert!(report.degraded);
  }
}
