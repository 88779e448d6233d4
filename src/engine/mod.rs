//! The register-facing facade over the mirror, the store, the queues and the catalog.
//!
//! Every operation absorbs storage faults at this boundary: callers get a safe
//! default (empty list, zero, `None`) and the fault is logged, counted or
//! published as a [`Notice`].

mod lifecycle;
mod usage;

pub use lifecycle::InitReport;
pub use usage::UsageEstimate;

use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{LegacyStore, PersistentStore};
use crate::catalog::{
  details, CachedDetails, Catalog, CustomerRecord, ItemQuery, ItemRecord, PriceListItem,
};
use crate::config::Config;
use crate::db::Location;
use crate::error::{is_unavailable, Notice};
use crate::losses::{LossCounters, LossReport};
use crate::mirror::{self, Mirror, Slot};
use crate::queue::{OfflineQueues, QueueClass, QueueEntry, SyncTotals};
use crate::sync::{Reconciler, RpcClient, SyncReport};

const NOTICE_CAPACITY: usize = 256;

pub struct Engine {
  config: Config,
  store: Arc<PersistentStore>,
  legacy: Arc<LegacyStore>,
  mirror: Arc<Mirror>,
  queues: Arc<OfflineQueues>,
  reconciler: Reconciler,
  catalog: Catalog,
  losses: Arc<LossCounters>,
  notices: broadcast::Sender<Notice>,
}

impl Engine {
  /// Open the engine over the configured data directory.
  ///
  /// Must be called from within a Tokio runtime. Nothing touches the disk
  /// until [`Engine::initialize`] runs.
  pub fn open(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let legacy = LegacyStore::load(Some(LegacyStore::default_path(&data_dir)));
    Ok(Self::new(config, Location::in_dir(&data_dir), legacy))
  }

  /// Build an engine over explicit locations. Must be called from within a Tokio runtime.
  pub fn new(config: Config, location: Location, legacy: LegacyStore) -> Self {
    let losses = Arc::new(LossCounters::default());
    let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
    let store = Arc::new(PersistentStore::new(location, config.store.clone()));

    let (handle, worker) = mirror::channel(
      Arc::clone(&store),
      config.worker.clone(),
      Arc::clone(&losses),
    );
    worker.spawn();

    let mirror = Arc::new(Mirror::new(handle, Arc::clone(&losses), notices.clone()));
    let queues = Arc::new(OfflineQueues::new(
      Arc::clone(&mirror),
      Arc::clone(&losses),
      notices.clone(),
      config.cache.max_queue_items,
    ));
    let reconciler = Reconciler::new(
      Arc::clone(&queues),
      Arc::clone(&mirror),
      Arc::clone(&losses),
      notices.clone(),
      config.sync.policy,
    );
    let catalog = Catalog::new(Arc::clone(&store), config.cache.clone());

    Self {
      config,
      store,
      legacy: Arc::new(legacy),
      mirror,
      queues,
      reconciler,
      catalog,
      losses,
      notices,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Receive operator-facing warnings (replay failures, queue trims).
  pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
    self.notices.subscribe()
  }

  pub fn losses(&self) -> LossReport {
    self.losses.snapshot()
  }

  pub fn is_degraded(&self) -> bool {
    self.losses.is_degraded()
  }

  /// Wait until every slot write made so far has been committed.
  pub async fn flush(&self) {
    self.mirror.flush().await;
  }

  // Raw slot access

  pub fn slot(&self, slot: Slot) -> Value {
    self.mirror.get(slot)
  }

  pub fn set_slot(&self, slot: Slot, value: Value) {
    self.mirror.set_value(slot, value);
  }

  fn slot_as<T: DeserializeOwned + Default>(&self, slot: Slot) -> T {
    self.mirror.get_as(slot).unwrap_or_default()
  }

  /// Read `key` from a map-shaped slot.
  fn keyed(&self, slot: Slot, key: &str) -> Option<Value> {
    self
      .mirror
      .with(slot, |map| map.get(key).cloned())
      .filter(|value| !value.is_null())
  }

  /// Write `key` into a map-shaped slot.
  fn set_keyed(&self, slot: Slot, key: &str, value: Value) {
    self.mirror.update(slot, |map| {
      if !map.is_object() {
        *map = json!({});
      }
      if let Value::Object(map) = map {
        map.insert(key.to_string(), value);
      }
    });
  }

  // Session state

  pub fn is_cache_ready(&self) -> bool {
    self.slot_as(Slot::CacheReady)
  }

  pub fn opening_storage(&self) -> Option<Value> {
    Some(self.mirror.get(Slot::OpeningStorage)).filter(|v| !v.is_null())
  }

  pub fn set_opening_storage(&self, data: Value) {
    self.mirror.set_value(Slot::OpeningStorage, data);
  }

  pub fn clear_opening_storage(&self) {
    self.mirror.set_value(Slot::OpeningStorage, Value::Null);
  }

  pub fn opening_dialog_storage(&self) -> Option<Value> {
    Some(self.mirror.get(Slot::OpeningDialogStorage)).filter(|v| !v.is_null())
  }

  pub fn set_opening_dialog_storage(&self, data: Value) {
    self.mirror.set_value(Slot::OpeningDialogStorage, data);
  }

  pub fn sales_persons(&self) -> Vec<Value> {
    self.slot_as(Slot::SalesPersons)
  }

  pub fn set_sales_persons(&self, persons: Vec<Value>) {
    self.mirror.set(Slot::SalesPersons, &persons);
  }

  pub fn items_last_sync(&self) -> Option<String> {
    self.mirror.get_as(Slot::ItemsLastSync)
  }

  pub fn set_items_last_sync(&self, stamp: &str) {
    self.mirror.set(Slot::ItemsLastSync, stamp);
  }

  pub fn customers_last_sync(&self) -> Option<String> {
    self.mirror.get_as(Slot::CustomersLastSync)
  }

  pub fn set_customers_last_sync(&self, stamp: &str) {
    self.mirror.set(Slot::CustomersLastSync, stamp);
  }

  pub fn last_sync_totals(&self) -> SyncTotals {
    self.queues.totals()
  }

  pub fn set_last_sync_totals(&self, totals: SyncTotals) {
    self.mirror.set(Slot::SyncTotals, &totals);
  }

  // Settings and templates

  pub fn tax_inclusive(&self) -> bool {
    self.slot_as(Slot::TaxInclusive)
  }

  pub fn set_tax_inclusive(&self, value: bool) {
    self.mirror.set(Slot::TaxInclusive, &value);
  }

  pub fn tax_template(&self, name: &str) -> Option<Value> {
    self.keyed(Slot::TaxTemplateCache, name)
  }

  pub fn set_tax_template(&self, name: &str, doc: Value) {
    self.set_keyed(Slot::TaxTemplateCache, name, doc);
  }

  pub fn print_template(&self) -> String {
    self.slot_as(Slot::PrintTemplate)
  }

  pub fn set_print_template(&self, template: &str) {
    self.mirror.set(Slot::PrintTemplate, template);
  }

  pub fn terms_and_conditions(&self) -> String {
    self.slot_as(Slot::TermsAndConditions)
  }

  pub fn set_terms_and_conditions(&self, terms: &str) {
    self.mirror.set(Slot::TermsAndConditions, terms);
  }

  pub fn translations(&self, lang: &str) -> Option<Value> {
    self.keyed(Slot::TranslationCache, lang)
  }

  pub fn save_translations(&self, lang: &str, data: Value) {
    self.set_keyed(Slot::TranslationCache, lang, data);
  }

  pub fn is_manual_offline(&self) -> bool {
    self.slot_as(Slot::ManualOffline)
  }

  pub fn set_manual_offline(&self, offline: bool) {
    self.mirror.set(Slot::ManualOffline, &offline);
  }

  /// Flip manual offline mode and return the new state.
  pub fn toggle_manual_offline(&self) -> bool {
    self.mirror.update(Slot::ManualOffline, |value| {
      let next = !value.as_bool().unwrap_or(false);
      *value = json!(next);
      next
    })
  }

  // Derived caches

  pub fn item_uoms(&self, item_code: &str) -> Vec<Value> {
    match self.keyed(Slot::UomCache, item_code) {
      Some(Value::Array(uoms)) => uoms,
      _ => Vec::new(),
    }
  }

  pub fn save_item_uoms(&self, item_code: &str, uoms: Vec<Value>) {
    self.set_keyed(Slot::UomCache, item_code, Value::Array(uoms));
  }

  pub fn cached_offers(&self) -> Vec<Value> {
    self.slot_as(Slot::OffersCache)
  }

  pub fn save_offers(&self, offers: Vec<Value>) {
    self.mirror.set(Slot::OffersCache, &offers);
  }

  /// Snapshot offline details of `items` for a profile and price list.
  pub fn save_item_details_cache(&self, profile: &str, price_list: &str, items: &[Value]) {
    let now = chrono::Utc::now().timestamp_millis();
    let stored = self.mirror.update(Slot::ItemDetailsCache, |cache| {
      details::store(cache, profile, price_list, items, now)
    });
    debug!(profile, price_list, stored, "Cached item details");
  }

  /// Fresh detail snapshots for `codes`, merged over their base items, plus the
  /// codes that must be fetched.
  pub async fn cached_item_details(
    &self,
    profile: &str,
    price_list: &str,
    codes: &[String],
  ) -> CachedDetails {
    let now = chrono::Utc::now().timestamp_millis();
    let ttl = self.config.cache.item_details_ttl().num_milliseconds();
    let found = self.mirror.with(Slot::ItemDetailsCache, |cache| {
      details::lookup(cache, profile, price_list, codes, ttl, now)
    });

    match self.catalog.merge_details(found.clone()).await {
      Ok(merged) => merged,
      Err(e) => {
        absorb::<()>(Err(e), "merge item details");
        found
      }
    }
  }

  // Items, customers and prices

  /// Store raw backend items. Returns how many were written.
  pub async fn save_items(&self, items: Vec<Value>) -> usize {
    absorb(self.catalog.save_items(items).await, "save items").rows
  }

  pub async fn stored_items(&self, offset: usize, limit: usize) -> Vec<ItemRecord> {
    absorb(self.catalog.items(offset, limit).await, "read stored items")
  }

  pub async fn stored_items_count(&self) -> u64 {
    absorb(self.catalog.count_items().await, "count items")
  }

  pub async fn clear_stored_items(&self) {
    absorb(self.catalog.clear_items().await, "clear stored items")
  }

  pub async fn search_items(&self, query: &ItemQuery) -> Vec<ItemRecord> {
    absorb(self.catalog.search_items(query).await, "search items")
  }

  pub async fn save_customers(&self, customers: Vec<Value>) -> usize {
    absorb(self.catalog.save_customers(customers).await, "save customers").rows
  }

  pub async fn customers(&self, offset: usize, limit: usize) -> Vec<CustomerRecord> {
    absorb(self.catalog.customers(offset, limit).await, "read customers")
  }

  pub async fn customers_count(&self) -> u64 {
    absorb(self.catalog.count_customers().await, "count customers")
  }

  pub async fn clear_customers(&self) {
    absorb(self.catalog.clear_customers().await, "clear customers")
  }

  pub async fn save_price_list_items(&self, price_list: &str, items: &[PriceListItem]) -> usize {
    absorb(
      self.catalog.save_price_list_items(price_list, items).await,
      "save price list items",
    )
  }

  pub async fn cached_price_list_items(&self, price_list: &str) -> Option<Vec<ItemRecord>> {
    absorb(
      self.catalog.cached_price_list_items(price_list).await,
      "read cached price list items",
    )
  }

  pub async fn clear_price_list_cache(&self, price_list: Option<&str>) {
    absorb(
      self.catalog.clear_price_list_cache(price_list).await,
      "clear price list cache",
    )
  }

  // Offline queues

  /// Record a call for later replay. None if the entry could not be encoded.
  pub fn enqueue(&self, class: QueueClass, method: &str, args: Value) -> Option<String> {
    self.queues.enqueue(class, method, args)
  }

  pub fn queue(&self, class: QueueClass) -> Vec<QueueEntry> {
    self.queues.list(class)
  }

  pub fn queue_len(&self, class: QueueClass) -> usize {
    self.queues.len(class)
  }

  /// Drop one queued entry without replaying it.
  pub fn discard_queue_entry(&self, class: QueueClass, id: &str) -> bool {
    self.queues.remove(class, id)
  }

  pub fn purge_old_queue_entries(&self, limit: usize) -> usize {
    self.queues.purge_old_queue_entries(limit)
  }

  pub fn queue_health_check(&self, limit: usize) -> bool {
    self.queues.queue_health_check(limit)
  }

  /// Empty every queue and zero the sync totals.
  pub fn reset_offline_state(&self) {
    self.queues.reset();
  }

  /// Replay all queued calls through `rpc`.
  pub async fn sync_offline_queues<R: RpcClient>(&self, rpc: &R) -> SyncReport {
    self.reconciler.sync_all(rpc).await
  }
}

/// Collapse a storage result to its value or a default, logging the failure.
fn absorb<T: Default>(result: Result<T>, action: &str) -> T {
  match result {
    Ok(value) => value,
    Err(e) if is_unavailable(&e) => {
      debug!(action, "Store unavailable, using default");
      T::default()
    }
    Err(e) => {
      warn!("Failed to {}: {}", action, e);
      T::default()
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::Table;
  use crate::config::StoreConfig;

  pub(crate) fn memory_engine() -> Engine {
    Engine::new(Config::default(), Location::Memory, LegacyStore::load(None))
  }

  #[tokio::test]
  async fn test_slot_accessors_defaults_and_writes() {
    let engine = memory_engine();
    assert_eq!(engine.print_template(), "");
    assert!(!engine.tax_inclusive());
    assert_eq!(engine.opening_storage(), None);
    assert_eq!(engine.tax_template("VAT"), None);

    engine.set_print_template("<p/>");
    engine.set_tax_inclusive(true);
    engine.set_opening_storage(json!({ "pos_profile": "Main" }));
    engine.set_tax_template("VAT", json!({ "rate": 16 }));
    engine.save_translations("de", json!({ "Pay": "Zahlen" }));
    engine.save_item_uoms("ABC123", vec![json!({ "uom": "Box", "conversion_factor": 12 })]);
    engine.set_items_last_sync("2024-05-01 10:00:00");

    assert_eq!(engine.print_template(), "<p/>");
    assert!(engine.tax_inclusive());
    assert_eq!(engine.opening_storage(), Some(json!({ "pos_profile": "Main" })));
    assert_eq!(engine.tax_template("VAT"), Some(json!({ "rate": 16 })));
    assert_eq!(engine.translations("de"), Some(json!({ "Pay": "Zahlen" })));
    assert_eq!(engine.item_uoms("ABC123").len(), 1);
    assert!(engine.item_uoms("OTHER").is_empty());
    assert_eq!(engine.items_last_sync().as_deref(), Some("2024-05-01 10:00:00"));

    engine.clear_opening_storage();
    assert_eq!(engine.opening_storage(), None);
  }

  #[tokio::test]
  async fn test_toggle_manual_offline() {
    let engine = memory_engine();
    assert!(engine.toggle_manual_offline());
    assert!(engine.is_manual_offline());
    assert!(!engine.toggle_manual_offline());
  }

  #[tokio::test]
  async fn test_item_details_round_trip() {
    let engine = memory_engine();
    engine
      .save_items(vec![json!({ "item_code": "ABC123", "item_name": "Red Mug" })])
      .await;
    engine.save_item_details_cache(
      "Main",
      "Retail",
      &[json!({ "item_code": "ABC123", "actual_qty": 3, "description": "dropped" })],
    );

    let details = engine
      .cached_item_details("Main", "Retail", &["ABC123".into(), "NEW".into()])
      .await;
    assert_eq!(details.cached.len(), 1);
    assert_eq!(details.cached[0]["item_name"], json!("Red Mug"));
    assert_eq!(details.cached[0]["actual_qty"], json!(3));
    assert!(details.cached[0].get("description").is_none());
    assert_eq!(details.missing, vec!["NEW"]);
  }

  #[tokio::test]
  async fn test_unavailable_store_returns_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"x").unwrap();
    let config = Config {
      store: StoreConfig {
        open_retries: 1,
        health_retries: 0,
        retry_backoff_ms: 1,
      },
      ..Default::default()
    };
    let engine = Engine::new(
      config,
      Location::in_dir(&blocker),
      LegacyStore::load(None),
    );

    let report = engine.initialize().await;
    assert!(!report.healthy);
    assert!(engine.is_cache_ready());
    assert!(engine.search_items(&ItemQuery::text("mug")).await.is_empty());
    assert_eq!(engine.save_items(vec![json!({ "item_code": "A" })]).await, 0);
    assert_eq!(engine.cached_price_list_items("Retail").await, None);

    // The mirror keeps working in memory
    assert!(engine.enqueue(QueueClass::Invoice, "submit_invoice", json!({})).is_some());
    assert_eq!(engine.queue_len(QueueClass::Invoice), 1);
    assert!(engine.is_degraded());
    assert!(!engine.store.is_available());
    assert!(engine.store.count(Table::Items).await.is_err());
  }
}
