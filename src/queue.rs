//! Offline mutation queues.
//!
//! Each class of mutation (invoices, customers, payments) has its own FIFO
//! queue held in a mirror slot. Entries are plain JSON objects; fields are
//! read and patched in place so that rows written by older registers, which
//! may not carry every field, are preserved rather than dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Fault, Notice};
use crate::losses::LossCounters;
use crate::mirror::{Mirror, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
  Invoice,
  Customer,
  Payment,
}

impl QueueClass {
  /// Every queue, in listing order.
  pub const ALL: [QueueClass; 3] = [QueueClass::Invoice, QueueClass::Customer, QueueClass::Payment];

  pub fn slot(self) -> Slot {
    match self {
      QueueClass::Invoice => Slot::OfflineInvoices,
      QueueClass::Customer => Slot::OfflineCustomers,
      QueueClass::Payment => Slot::OfflinePayments,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      QueueClass::Invoice => "invoice",
      QueueClass::Customer => "customer",
      QueueClass::Payment => "payment",
    }
  }
}

impl fmt::Display for QueueClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for QueueClass {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "invoice" | "invoices" => Ok(QueueClass::Invoice),
      "customer" | "customers" => Ok(QueueClass::Customer),
      "payment" | "payments" => Ok(QueueClass::Payment),
      other => Err(format!("unknown queue '{}' (expected invoice, customer or payment)", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
  #[default]
  Pending,
  Syncing,
  Failed,
}

impl EntryStatus {
  fn as_str(self) -> &'static str {
    match self {
      EntryStatus::Pending => "pending",
      EntryStatus::Syncing => "syncing",
      EntryStatus::Failed => "failed",
    }
  }
}

/// A recorded backend call waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
  pub id: String,
  pub method: String,
  #[serde(default)]
  pub args: Value,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub status: EntryStatus,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl QueueEntry {
  fn new(class: QueueClass, method: &str, args: Value, enqueued_at: DateTime<Utc>, seq: u64) -> Self {
    Self {
      id: fingerprint(class, method, &args, enqueued_at, seq),
      method: method.to_string(),
      args,
      enqueued_at,
      status: EntryStatus::Pending,
      attempts: 0,
      last_error: None,
    }
  }
}

/// Hex SHA-256 over everything that makes an entry unique.
fn fingerprint(class: QueueClass, method: &str, args: &Value, at: DateTime<Utc>, seq: u64) -> String {
  let mut hasher = Sha256::new();
  hasher.update(class.as_str().as_bytes());
  hasher.update(b"\x1f");
  hasher.update(method.as_bytes());
  hasher.update(b"\x1f");
  hasher.update(args.to_string().as_bytes());
  hasher.update(b"\x1f");
  hasher.update(at.to_rfc3339().as_bytes());
  hasher.update(b"\x1f");
  hasher.update(seq.to_le_bytes());
  hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTotals {
  /// Entries still waiting (not failed)
  #[serde(default)]
  pub pending: u64,
  /// Successful replays since the last reset
  #[serde(default)]
  pub synced: u64,
  /// Entries whose last replay failed
  #[serde(default)]
  pub drafted: u64,
}

pub struct OfflineQueues {
  mirror: Arc<Mirror>,
  losses: Arc<LossCounters>,
  notices: broadcast::Sender<Notice>,
  max_items: usize,
  seq: AtomicU64,
}

impl OfflineQueues {
  pub fn new(
    mirror: Arc<Mirror>,
    losses: Arc<LossCounters>,
    notices: broadcast::Sender<Notice>,
    max_items: usize,
  ) -> Self {
    Self {
      mirror,
      losses,
      notices,
      max_items: max_items.max(1),
      seq: AtomicU64::new(0),
    }
  }

  /// Append a pending call to `class`'s queue and return its id.
  ///
  /// When the queue is over its ceiling the oldest entries are trimmed; the
  /// trim is logged, counted and published as a notice.
  pub fn enqueue(&self, class: QueueClass, method: &str, args: Value) -> Option<String> {
    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
    let entry = QueueEntry::new(class, method, args, Utc::now(), seq);
    let value = match serde_json::to_value(&entry) {
      Ok(value) => value,
      Err(e) => {
        warn!(queue = %class, "Failed to encode queue entry: {}", e);
        self.losses.record_serialization_fallback();
        return None;
      }
    };

    let max_items = self.max_items;
    let trimmed = self.mirror.update(class.slot(), |slot| {
      with_entries(slot, |entries| {
        entries.push(value);
        trim_oldest(entries, max_items)
      })
    });

    if trimmed > 0 {
      self.report_trim(class, trimmed);
    }
    self.refresh_totals();
    debug!(queue = %class, id = %entry.id, method, "Queued offline call");
    Some(entry.id)
  }

  /// Decoded entries of a queue, oldest first.
  pub fn list(&self, class: QueueClass) -> Vec<QueueEntry> {
    let value = self.mirror.get(class.slot());
    let Value::Array(entries) = value else {
      return Vec::new();
    };

    entries
      .into_iter()
      .filter_map(|entry| match serde_json::from_value(entry) {
        Ok(entry) => Some(entry),
        Err(e) => {
          debug!(queue = %class, "Skipping unreadable queue entry: {}", e);
          None
        }
      })
      .collect()
  }

  pub fn len(&self, class: QueueClass) -> usize {
    self
      .mirror
      .with(class.slot(), |value| value.as_array().map_or(0, Vec::len))
  }

  pub fn is_empty(&self, class: QueueClass) -> bool {
    self.len(class) == 0
  }

  /// Trim every queue to at most `limit` entries, oldest first. Returns the
  /// number of entries removed.
  pub fn purge_old_queue_entries(&self, limit: usize) -> usize {
    let mut total = 0;
    for class in QueueClass::ALL {
      if self.len(class) <= limit {
        continue;
      }
      let trimmed = self
        .mirror
        .update(class.slot(), |slot| with_entries(slot, |entries| trim_oldest(entries, limit)));
      if trimmed > 0 {
        self.report_trim(class, trimmed);
        total += trimmed;
      }
    }
    if total > 0 {
      self.refresh_totals();
    }
    total
  }

  /// True when any queue holds more than `limit` entries.
  pub fn queue_health_check(&self, limit: usize) -> bool {
    QueueClass::ALL.into_iter().any(|class| self.len(class) > limit)
  }

  /// Drop a single entry by id. Returns whether it was present.
  pub fn remove(&self, class: QueueClass, id: &str) -> bool {
    let removed = self
      .mirror
      .update(class.slot(), |slot| with_entries(slot, |entries| retain_other(entries, id)));
    if removed {
      self.refresh_totals();
    }
    removed
  }

  /// Empty every queue and zero the totals.
  pub fn reset(&self) {
    for class in QueueClass::ALL {
      self.mirror.set_value(class.slot(), json!([]));
    }
    self.mirror.set(Slot::SyncTotals, &SyncTotals::default());
  }

  pub fn totals(&self) -> SyncTotals {
    self.mirror.get_as(Slot::SyncTotals).unwrap_or_default()
  }

  /// Mark an entry as being replayed.
  pub fn mark_syncing(&self, class: QueueClass, id: &str) -> bool {
    self.patch(class, id, |entry| {
      entry.insert("status".into(), json!(EntryStatus::Syncing.as_str()));
    })
  }

  /// Remove a successfully replayed entry and count it as synced.
  pub fn complete(&self, class: QueueClass, id: &str) -> bool {
    let removed = self
      .mirror
      .update(class.slot(), |slot| with_entries(slot, |entries| retain_other(entries, id)));
    if removed {
      self.mirror.update(Slot::SyncTotals, |totals| {
        let synced = totals.get("synced").and_then(Value::as_u64).unwrap_or(0);
        set_field(totals, "synced", json!(synced + 1));
      });
      self.refresh_totals();
    }
    removed
  }

  /// Record a failed replay. The entry stays queued.
  pub fn fail(&self, class: QueueClass, id: &str, error: &str) -> bool {
    let found = self.patch(class, id, |entry| {
      let attempts = entry.get("attempts").and_then(Value::as_u64).unwrap_or(0);
      entry.insert("status".into(), json!(EntryStatus::Failed.as_str()));
      entry.insert("attempts".into(), json!(attempts + 1));
      entry.insert("last_error".into(), json!(error));
    });
    if found {
      self.refresh_totals();
    }
    found
  }

  fn patch(&self, class: QueueClass, id: &str, f: impl FnOnce(&mut Map<String, Value>)) -> bool {
    self.mirror.update(class.slot(), |slot| {
      with_entries(slot, |entries| {
        let entry = entries
          .iter_mut()
          .filter_map(Value::as_object_mut)
          .find(|entry| entry.get("id").and_then(Value::as_str) == Some(id));
        match entry {
          Some(entry) => {
            f(entry);
            true
          }
          None => false,
        }
      })
    })
  }

  /// Recompute pending/drafted from the queues, keeping the synced count.
  fn refresh_totals(&self) {
    let mut pending = 0u64;
    let mut drafted = 0u64;
    for class in QueueClass::ALL {
      self.mirror.with(class.slot(), |value| {
        for entry in value.as_array().into_iter().flatten() {
          if entry.get("status").and_then(Value::as_str) == Some(EntryStatus::Failed.as_str()) {
            drafted += 1;
          } else {
            pending += 1;
          }
        }
      });
    }

    self.mirror.update(Slot::SyncTotals, |totals| {
      set_field(totals, "pending", json!(pending));
      set_field(totals, "drafted", json!(drafted));
    });
  }

  fn report_trim(&self, class: QueueClass, trimmed: usize) {
    warn!(queue = %class, trimmed, "Offline queue over capacity, dropped oldest entries");
    self.losses.record_queue_trim(trimmed);
    let _ = self.notices.send(Notice::now(Fault::QueueOverflow {
      queue: class.to_string(),
      trimmed,
    }));
  }
}

/// Run `f` over the slot's entry list, replacing a non-array value with an empty one.
fn with_entries<R>(slot: &mut Value, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
  let mut entries = match std::mem::take(slot) {
    Value::Array(entries) => entries,
    _ => Vec::new(),
  };
  let result = f(&mut entries);
  *slot = Value::Array(entries);
  result
}

fn trim_oldest(entries: &mut Vec<Value>, limit: usize) -> usize {
  let excess = entries.len().saturating_sub(limit);
  if excess > 0 {
    entries.drain(..excess);
  }
  excess
}

/// Drop the entry with `id`; true when something was removed.
fn retain_other(entries: &mut Vec<Value>, id: &str) -> bool {
  let before = entries.len();
  entries.retain(|entry| entry.get("id").and_then(Value::as_str) != Some(id));
  entries.len() != before
}

fn set_field(target: &mut Value, field: &str, value: Value) {
  if !target.is_object() {
    *target = json!({});
  }
  if let Value::Object(map) = target {
    map.insert(field.to_string(), value);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::PersistentStore;
  use crate::config::{StoreConfig, WorkerConfig};
  use crate::db::Location;
  use crate::mirror;

  fn queues(max_items: usize) -> (OfflineQueues, broadcast::Receiver<Notice>, Arc<LossCounters>) {
    let store = Arc::new(PersistentStore::new(Location::Memory, StoreConfig::default()));
    let losses = Arc::new(LossCounters::default());
    let (handle, worker) = mirror::channel(store, WorkerConfig::default(), Arc::clone(&losses));
    worker.spawn();
    let (tx, rx) = broadcast::channel(1024);
    let mirror = Arc::new(Mirror::new(handle, Arc::clone(&losses), tx.clone()));
    (OfflineQueues::new(mirror, Arc::clone(&losses), tx, max_items), rx, losses)
  }

  #[tokio::test]
  async fn test_ceiling_keeps_most_recent_entries() {
    let (queues, mut notices, losses) = queues(1000);

    for n in 0..1500 {
      queues.enqueue(QueueClass::Invoice, "submit_invoice", json!({ "n": n }));
    }
    assert_eq!(queues.purge_old_queue_entries(1000), 0);

    let entries = queues.list(QueueClass::Invoice);
    assert_eq!(entries.len(), 1000);
    assert_eq!(entries[0].args, json!({ "n": 500 }));
    assert_eq!(entries[999].args, json!({ "n": 1499 }));
    assert_eq!(losses.snapshot().queue_trimmed, 500);

    let notice = notices.recv().await.unwrap();
    assert!(matches!(notice.fault, Fault::QueueOverflow { trimmed: 1, .. }));
  }

  #[tokio::test]
  async fn test_purge_and_health_check() {
    let (queues, _notices, _losses) = queues(1000);
    for n in 0..20 {
      queues.enqueue(QueueClass::Payment, "pay", json!(n));
    }
    queues.enqueue(QueueClass::Customer, "create", json!({}));

    assert!(queues.queue_health_check(10));
    assert!(!queues.queue_health_check(20));

    assert_eq!(queues.purge_old_queue_entries(10), 10);
    assert_eq!(queues.len(QueueClass::Payment), 10);
    assert_eq!(queues.list(QueueClass::Payment)[0].args, json!(10));
    assert_eq!(queues.len(QueueClass::Customer), 1);
    assert!(!queues.queue_health_check(10));
  }

  #[tokio::test]
  async fn test_totals_follow_outcomes() {
    let (queues, _notices, _losses) = queues(1000);
    let a = queues.enqueue(QueueClass::Invoice, "m", json!(1)).unwrap();
    let b = queues.enqueue(QueueClass::Invoice, "m", json!(2)).unwrap();
    queues.enqueue(QueueClass::Invoice, "m", json!(3)).unwrap();
    assert_ne!(a, b);

    assert!(queues.mark_syncing(QueueClass::Invoice, &a));
    assert!(queues.complete(QueueClass::Invoice, &a));
    assert!(queues.fail(QueueClass::Invoice, &b, "timeout"));
    assert!(queues.fail(QueueClass::Invoice, &b, "timeout"));

    assert_eq!(
      queues.totals(),
      SyncTotals {
        pending: 1,
        synced: 1,
        drafted: 1
      }
    );

    let failed = &queues.list(QueueClass::Invoice)[0];
    assert_eq!(failed.id, b);
    assert_eq!(failed.status, EntryStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.last_error.as_deref(), Some("timeout"));

    assert!(!queues.complete(QueueClass::Invoice, "missing"));
  }

  #[tokio::test]
  async fn test_remove_and_reset() {
    let (queues, _notices, _losses) = queues(1000);
    let id = queues.enqueue(QueueClass::Customer, "create", json!({})).unwrap();
    queues.enqueue(QueueClass::Invoice, "m", json!({})).unwrap();

    assert!(queues.remove(QueueClass::Customer, &id));
    assert!(!queues.remove(QueueClass::Customer, &id));
    assert!(queues.is_empty(QueueClass::Customer));

    queues.reset();
    assert!(queues.is_empty(QueueClass::Invoice));
    assert_eq!(queues.totals(), SyncTotals::default());
  }

  #[test]
  fn test_queue_class_parsing() {
    assert_eq!("Invoices".parse::<QueueClass>(), Ok(QueueClass::Invoice));
    assert!("orders".parse::<QueueClass>().is_err());
  }
}
