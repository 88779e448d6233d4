//! Item, customer and price caches with indexed search.

pub mod details;
mod prices;
mod records;

pub use details::CachedDetails;
pub use prices::{PriceListItem, PriceRecord};
pub use records::{CustomerRecord, ItemRecord};

use chrono::Utc;
use color_eyre::Result;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{BulkPutReport, Match, PersistentStore, Table, TermField};
use crate::config::CacheConfig;

/// Item search parameters.
#[derive(Debug, Clone)]
pub struct ItemQuery {
  pub search: String,
  /// Exact group name, compared case-insensitively; `all` disables the filter
  pub item_group: Option<String>,
  pub limit: usize,
  pub offset: usize,
}

impl Default for ItemQuery {
  fn default() -> Self {
    Self {
      search: String::new(),
      item_group: None,
      limit: 100,
      offset: 0,
    }
  }
}

impl ItemQuery {
  pub fn text(search: impl Into<String>) -> Self {
    Self {
      search: search.into(),
      ..Default::default()
    }
  }

  fn group_filter(&self) -> Option<String> {
    self
      .item_group
      .as_deref()
      .map(|g| g.trim().to_lowercase())
      .filter(|g| !g.is_empty() && g != "all")
  }
}

/// Indexed fields probed by a search, with how each is compared.
const INDEXED_FIELDS: [(TermField, Match); 6] = [
  (TermField::Code, Match::Prefix),
  (TermField::Name, Match::Prefix),
  (TermField::Barcode, Match::Exact),
  (TermField::Keyword, Match::Prefix),
  (TermField::Serial, Match::Exact),
  (TermField::Batch, Match::Exact),
];

pub struct Catalog {
  store: Arc<PersistentStore>,
  settings: CacheConfig,
}

impl Catalog {
  pub fn new(store: Arc<PersistentStore>, settings: CacheConfig) -> Self {
    Self { store, settings }
  }

  /// Derive lookup fields for raw backend items and store them in chunks.
  /// Items without an `item_code` are skipped.
  pub async fn save_items(&self, raw: Vec<Value>) -> Result<BulkPutReport> {
    let items: Vec<ItemRecord> = raw
      .into_iter()
      .filter_map(|value| match ItemRecord::from_raw(value) {
        Ok(item) => Some(item),
        Err(e) => {
          warn!("Skipping unusable item: {}", e);
          None
        }
      })
      .collect();

    self
      .store
      .bulk_put(&items, self.settings.bulk_chunk_size)
      .await
  }

  pub async fn items(&self, offset: usize, limit: usize) -> Result<Vec<ItemRecord>> {
    self
      .store
      .range_query(|_: &ItemRecord| true, offset, limit)
      .await
  }

  pub async fn count_items(&self) -> Result<u64> {
    self.store.count(Table::Items).await
  }

  pub async fn clear_items(&self) -> Result<()> {
    self.store.clear(Table::Items).await
  }

  /// Search stored items.
  ///
  /// A term is first looked up in the index (prefix on code, name and name
  /// keywords, equality on barcodes, serials and batches). Only when that finds
  /// nothing are all items scanned for a substring match. An empty term lists
  /// items of the group.
  pub async fn search_items(&self, query: &ItemQuery) -> Result<Vec<ItemRecord>> {
    let term = query.search.trim().to_lowercase();
    let group = query.group_filter();

    if term.is_empty() {
      return self
        .store
        .range_query(
          |item: &ItemRecord| item.in_group(group.as_deref()),
          query.offset,
          query.limit,
        )
        .await;
    }

    let mut results = self.indexed_search(&term, group.as_deref()).await?;
    if results.is_empty() {
      debug!(term = %term, "No indexed match, scanning items");
      results = self
        .store
        .range_query(
          |item: &ItemRecord| item.in_group(group.as_deref()) && item.matches_text(&term),
          0,
          usize::MAX,
        )
        .await?;
    }

    let mut seen = HashSet::new();
    Ok(
      results
        .into_iter()
        .filter(|item| seen.insert(item.item_code.clone()))
        .skip(query.offset)
        .take(query.limit)
        .collect(),
    )
  }

  async fn indexed_search(&self, term: &str, group: Option<&str>) -> Result<Vec<ItemRecord>> {
    let mut matched = BTreeSet::new();
    for (field, matching) in INDEXED_FIELDS {
      matched.extend(self.store.lookup(Table::Items, field, matching, term).await?);
    }
    let mut keys: Vec<String> = matched.into_iter().collect();

    if let Some(group) = group {
      let members: HashSet<String> = self
        .store
        .lookup(Table::Items, TermField::Group, Match::Exact, group)
        .await?
        .into_iter()
        .collect();
      keys.retain(|key| members.contains(key));
    }

    self.store.get_many(&keys).await
  }

  /// Store customers, keeping only the offline fields.
  pub async fn save_customers(&self, raw: Vec<Value>) -> Result<BulkPutReport> {
    let customers: Vec<CustomerRecord> = raw
      .into_iter()
      .filter_map(|value| match serde_json::from_value(value) {
        Ok(customer) => Some(customer),
        Err(e) => {
          warn!("Skipping unusable customer: {}", e);
          None
        }
      })
      .collect();

    self
      .store
      .bulk_put(&customers, self.settings.bulk_chunk_size)
      .await
  }

  pub async fn customers(&self, offset: usize, limit: usize) -> Result<Vec<CustomerRecord>> {
    self
      .store
      .range_query(|_: &CustomerRecord| true, offset, limit)
      .await
  }

  pub async fn count_customers(&self) -> Result<u64> {
    self.store.count(Table::Customers).await
  }

  pub async fn clear_customers(&self) -> Result<()> {
    self.store.clear(Table::Customers).await
  }

  /// Cache rates for a price list, stamped now. An empty price list name is ignored.
  pub async fn save_price_list_items(
    &self,
    price_list: &str,
    items: &[PriceListItem],
  ) -> Result<usize> {
    if price_list.is_empty() {
      return Ok(0);
    }

    let now = Utc::now().timestamp_millis();
    let records: Vec<PriceRecord> = items
      .iter()
      .map(|item| PriceRecord::new(price_list, item, now))
      .collect();
    let report = self
      .store
      .bulk_put(&records, self.settings.bulk_chunk_size)
      .await?;
    Ok(report.rows)
  }

  /// Fresh rates for a price list merged into their base items.
  ///
  /// None when nothing usable is cached: no rows, only stale rows, or no
  /// stored item for any fresh rate.
  pub async fn cached_price_list_items(&self, price_list: &str) -> Result<Option<Vec<ItemRecord>>> {
    if price_list.is_empty() {
      return Ok(None);
    }

    let keys = self
      .store
      .lookup(Table::ItemPrices, TermField::PriceList, Match::Exact, price_list)
      .await?;
    if keys.is_empty() {
      return Ok(None);
    }

    let now = Utc::now().timestamp_millis();
    let ttl = self.settings.price_ttl().num_milliseconds();
    let fresh: Vec<PriceRecord> = self
      .store
      .get_many::<PriceRecord>(&keys)
      .await?
      .into_iter()
      .filter(|price| price.is_fresh(now, ttl))
      .collect();
    if fresh.is_empty() {
      debug!(price_list, "Cached rates are stale");
      return Ok(None);
    }

    let codes: Vec<String> = fresh.iter().map(|p| p.item_code.clone()).collect();
    let base: HashMap<String, ItemRecord> = self
      .store
      .get_many::<ItemRecord>(&codes)
      .await?
      .into_iter()
      .map(|item| (item.item_code.clone(), item))
      .collect();

    let merged: Vec<ItemRecord> = fresh
      .iter()
      .filter_map(|price| {
        let mut item = base.get(&price.item_code)?.clone();
        item.rate = price.rate;
        item.price_list_rate = prices::effective_list_rate(price.price_list_rate, price.rate);
        Some(item)
      })
      .collect();

    Ok(if merged.is_empty() { None } else { Some(merged) })
  }

  /// Drop cached rates for one price list, or for all of them.
  pub async fn clear_price_list_cache(&self, price_list: Option<&str>) -> Result<()> {
    match price_list {
      Some(price_list) => {
        let keys = self
          .store
          .lookup(Table::ItemPrices, TermField::PriceList, Match::Exact, price_list)
          .await?;
        let deleted = self.store.delete(Table::ItemPrices, &keys).await?;
        debug!(price_list, deleted, "Cleared cached rates");
        Ok(())
      }
      None => self.store.clear(Table::ItemPrices).await,
    }
  }

  /// Overlay detail snapshots on their stored base items.
  pub async fn merge_details(&self, mut details: CachedDetails) -> Result<CachedDetails> {
    if details.cached.is_empty() {
      return Ok(details);
    }

    let codes: Vec<String> = details
      .cached
      .iter()
      .filter_map(|d| d.get("item_code").and_then(Value::as_str).map(String::from))
      .collect();
    let base: HashMap<String, ItemRecord> = self
      .store
      .get_many::<ItemRecord>(&codes)
      .await?
      .into_iter()
      .map(|item| (item.item_code.clone(), item))
      .collect();

    details.cached = details
      .cached
      .into_iter()
      .map(|snapshot| {
        let base = snapshot
          .get("item_code")
          .and_then(Value::as_str)
          .and_then(|code| base.get(code))
          .and_then(|item| serde_json::to_value(item).ok())
          .unwrap_or(Value::Null);
        details::merge_over(base, &snapshot)
      })
      .collect();
    Ok(details)
  }
}
