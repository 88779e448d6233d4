//! In-memory mirror of every cache slot.
//!
//! Reads are answered from memory and never touch the store. Writes update
//! memory immediately and hand a copy to the persistence worker, which commits
//! it in the background. Ordering between writes to the same slot is preserved
//! because submission happens under the mirror's write lock.

mod slot;
mod worker;

pub use slot::Slot;
pub use worker::{channel, CommitPause, PersistenceWorker, WorkerHandle};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{LegacyStore, PersistentStore};
use crate::error::{is_unavailable, Fault, Notice};
use crate::losses::LossCounters;

/// Where hydrated slot values came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrateReport {
  pub from_store: usize,
  pub from_legacy: usize,
}

pub struct Mirror {
  slots: RwLock<HashMap<Slot, Value>>,
  worker: WorkerHandle,
  losses: Arc<LossCounters>,
  notices: broadcast::Sender<Notice>,
}

impl Mirror {
  /// Create a mirror holding every slot's default value.
  pub fn new(
    worker: WorkerHandle,
    losses: Arc<LossCounters>,
    notices: broadcast::Sender<Notice>,
  ) -> Self {
    Self {
      slots: RwLock::new(defaults()),
      worker,
      losses,
      notices,
    }
  }

  fn read(&self) -> RwLockReadGuard<'_, HashMap<Slot, Value>> {
    self.slots.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, HashMap<Slot, Value>> {
    self.slots.write().unwrap_or_else(|e| e.into_inner())
  }

  pub fn get(&self, slot: Slot) -> Value {
    self
      .read()
      .get(&slot)
      .cloned()
      .unwrap_or_else(|| slot.default_value())
  }

  /// Inspect a slot without cloning it.
  pub fn with<R>(&self, slot: Slot, f: impl FnOnce(&Value) -> R) -> R {
    let slots = self.read();
    match slots.get(&slot) {
      Some(value) => f(value),
      None => f(&slot.default_value()),
    }
  }

  /// Slot value decoded as `T`; None when the stored shape does not fit.
  pub fn get_as<T: DeserializeOwned>(&self, slot: Slot) -> Option<T> {
    serde_json::from_value(self.get(slot)).ok()
  }

  /// Replace a slot with `value`. A value that cannot be represented as plain
  /// data is replaced by the slot's default, counted and announced.
  pub fn set<T: Serialize + ?Sized>(&self, slot: Slot, value: &T) {
    let value = match serde_json::to_value(value) {
      Ok(value) => value,
      Err(e) => {
        warn!(slot = slot.key(), "Value is not plain data, storing default: {}", e);
        self.losses.record_serialization_fallback();
        let _ = self.notices.send(Notice::now(Fault::SerializationFailure {
          slot: slot.key().to_string(),
          reason: e.to_string(),
        }));
        slot.default_value()
      }
    };
    self.set_value(slot, value);
  }

  pub fn set_value(&self, slot: Slot, value: Value) {
    let mut slots = self.write();
    self.worker.submit(slot, value.clone());
    slots.insert(slot, value);
  }

  /// Mutate a slot in place and persist the result.
  pub fn update<R>(&self, slot: Slot, f: impl FnOnce(&mut Value) -> R) -> R {
    let mut slots = self.write();
    let value = slots.entry(slot).or_insert_with(|| slot.default_value());
    let result = f(value);
    self.worker.submit(slot, value.clone());
    result
  }

  /// Replace a slot in memory only.
  pub fn put_local(&self, slot: Slot, value: Value) {
    self.write().insert(slot, value);
  }

  /// Return every slot to its default, in memory only.
  pub fn reset(&self) {
    *self.write() = defaults();
  }

  /// Fill the mirror from the store, falling back to the legacy flat store.
  ///
  /// Values found only in the legacy store are written forward into the
  /// persistent store.
  pub async fn hydrate(&self, store: &PersistentStore, legacy: &LegacyStore) -> HydrateReport {
    let mut report = HydrateReport::default();

    for slot in Slot::ALL {
      let stored = match store.get_raw(slot.destination(), slot.key()).await {
        Ok(Some(data)) => match serde_json::from_str::<Value>(&data) {
          Ok(value) => Some(value),
          Err(e) => {
            warn!(slot = slot.key(), "Ignoring undecodable stored slot: {}", e);
            None
          }
        },
        Ok(None) => None,
        Err(e) => {
          if !is_unavailable(&e) {
            warn!(slot = slot.key(), "Failed to read slot: {}", e);
          }
          None
        }
      };

      if let Some(value) = stored {
        self.put_local(slot, value);
        report.from_store += 1;
      } else if let Some(value) = legacy.get(slot.key()) {
        self.set_value(slot, value);
        report.from_legacy += 1;
      }
    }

    debug!(
      from_store = report.from_store,
      from_legacy = report.from_legacy,
      "Hydrated mirror"
    );
    report
  }

  /// Wait for every write submitted so far to reach the store.
  pub async fn flush(&self) {
    self.worker.flush().await;
  }

  /// Block background commits and drop unflushed writes until the guard is released.
  pub async fn pause_persistence(&self) -> CommitPause<'_> {
    self.worker.pause().await
  }

  /// Approximate serialized size of every slot.
  pub fn bytes(&self) -> u64 {
    self
      .read()
      .iter()
      .map(|(slot, value)| (slot.key().len() + value.to_string().len()) as u64)
      .sum()
  }
}

fn defaults() -> HashMap<Slot, Value> {
  Slot::ALL
    .into_iter()
    .map(|slot| (slot, slot.default_value()))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Table;
  use crate::config::{StoreConfig, WorkerConfig};
  use crate::db::Location;
  use serde_json::json;

  fn setup(location: Location) -> (Mirror, Arc<PersistentStore>) {
    let store = Arc::new(PersistentStore::new(location, StoreConfig::default()));
    let losses = Arc::new(LossCounters::default());
    let (handle, worker) = channel(Arc::clone(&store), WorkerConfig::default(), Arc::clone(&losses));
    worker.spawn();
    let (notices, _) = broadcast::channel(16);
    (Mirror::new(handle, losses, notices), store)
  }

  #[tokio::test]
  async fn test_defaults_before_any_write() {
    let (mirror, _store) = setup(Location::Memory);
    assert_eq!(mirror.get(Slot::OfflineInvoices), json!([]));
    assert_eq!(mirror.get(Slot::ManualOffline), json!(false));
    assert_eq!(mirror.get(Slot::OpeningStorage), Value::Null);
  }

  #[tokio::test]
  async fn test_write_reaches_store_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let location = Location::in_dir(dir.path());

    {
      let (mirror, _store) = setup(location.clone());
      mirror.set(Slot::PrintTemplate, "<b>receipt</b>");
      mirror.update(Slot::OfflineInvoices, |queue| {
        if let Value::Array(entries) = queue {
          entries.push(json!({"id": "a"}));
        }
      });
      assert_eq!(mirror.get(Slot::PrintTemplate), json!("<b>receipt</b>"));
      mirror.flush().await;
    }

    let (fresh, store) = setup(location);
    let legacy = LegacyStore::load(None);
    let report = fresh.hydrate(&store, &legacy).await;
    assert_eq!(report.from_store, 2);
    assert_eq!(fresh.get(Slot::PrintTemplate), json!("<b>receipt</b>"));
    assert_eq!(fresh.get(Slot::OfflineInvoices), json!([{"id": "a"}]));
  }

  #[tokio::test]
  async fn test_hydrate_migrates_legacy_values() {
    let (mirror, store) = setup(Location::Memory);
    let legacy = LegacyStore::load(None);
    legacy.set("terms_and_conditions", &json!("No refunds")).unwrap();

    let report = mirror.hydrate(&store, &legacy).await;
    assert_eq!(report.from_legacy, 1);
    assert_eq!(mirror.get(Slot::TermsAndConditions), json!("No refunds"));

    mirror.flush().await;
    assert_eq!(
      store.get_raw(Table::Kv, "terms_and_conditions").await.unwrap(),
      Some("\"No refunds\"".to_string())
    );
  }

  #[tokio::test]
  async fn test_reset_restores_defaults_without_persisting() {
    let (mirror, store) = setup(Location::Memory);
    mirror.put_local(Slot::TaxInclusive, json!(true));
    mirror.reset();
    mirror.flush().await;

    assert_eq!(mirror.get(Slot::TaxInclusive), json!(false));
    assert_eq!(store.get_raw(Table::Kv, "tax_inclusive").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_get_as_rejects_wrong_shape() {
    let (mirror, _store) = setup(Location::Memory);
    mirror.set(Slot::SalesPersons, &vec!["Ann", "Bo"]);
    assert_eq!(
      mirror.get_as::<Vec<String>>(Slot::SalesPersons),
      Some(vec!["Ann".to_string(), "Bo".to_string()])
    );
    assert_eq!(mirror.get_as::<u32>(Slot::SalesPersons), None);
  }

  #[tokio::test]
  async fn test_unserializable_value_stores_default() {
    let (mirror, store) = setup(Location::Memory);
    let mut notices = mirror.notices.subscribe();
    mirror.set(Slot::UomCache, &json!({ "ABC123": [{ "uom": "Box" }] }));

    let mut by_pair: HashMap<(u8, u8), u8> = HashMap::new();
    by_pair.insert((1, 2), 3);
    mirror.set(Slot::UomCache, &by_pair);

    assert_eq!(mirror.get(Slot::UomCache), json!({}));
    assert_eq!(mirror.losses.snapshot().serialization_fallbacks, 1);
    match notices.recv().await.unwrap().fault {
      Fault::SerializationFailure { slot, .. } => assert_eq!(slot, "uom_cache"),
      other => panic!("unexpected fault: {:?}", other),
    }

    mirror.flush().await;
    assert_eq!(
      store.get_raw(Table::Kv, "uom_cache").await.unwrap(),
      Some("{}".to_string())
    );
  }
}
