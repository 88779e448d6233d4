//! Cache size estimate and eviction of derived caches.

use color_eyre::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{absorb, Engine};
use crate::cache::Table;
use crate::mirror::Slot;

/// Approximate cache footprint in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageEstimate {
  pub total: u64,
  /// Mirror slots plus the legacy flat store
  pub mirror_bytes: u64,
  pub store_bytes: u64,
  /// Share of the configured ceiling, capped at 100
  pub percentage: u8,
}

impl UsageEstimate {
  fn new(mirror_bytes: u64, store_bytes: u64, ceiling: u64) -> Self {
    let total = mirror_bytes + store_bytes;
    let percentage = (total as f64 / ceiling.max(1) as f64 * 100.0)
      .round()
      .min(100.0) as u8;
    Self {
      total,
      mirror_bytes,
      store_bytes,
      percentage,
    }
  }
}

impl Engine {
  /// Estimate how much space the cache occupies. All zero if the store cannot be scanned.
  pub async fn cache_usage_estimate(&self) -> UsageEstimate {
    match self.store_bytes().await {
      Ok(store_bytes) => UsageEstimate::new(
        self.mirror.bytes() + self.legacy.bytes(),
        store_bytes,
        self.config.cache.usage_ceiling_bytes,
      ),
      Err(e) => {
        absorb::<()>(Err(e), "estimate cache usage");
        UsageEstimate::default()
      }
    }
  }

  async fn store_bytes(&self) -> Result<u64> {
    let mut total = self.store.scan_term_bytes().await?;
    for table in Table::ALL {
      total += self.store.scan_bytes(table).await?;
    }
    Ok(total)
  }

  /// Drop derived caches that can be rebuilt from the backend. Queues,
  /// items and customers are kept.
  pub async fn reduce_cache_usage(&self) {
    if let Err(e) = self.catalog.clear_price_list_cache(None).await {
      warn!("Failed to clear price list cache: {}", e);
    }

    let evicted: Vec<&str> = Slot::ALL
      .into_iter()
      .filter(|slot| slot.is_evictable())
      .map(|slot| {
        self.mirror.set_value(slot, slot.default_value());
        slot.key()
      })
      .collect();
    info!(slots = ?evicted, "Reduced cache usage");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::PriceListItem;
  use crate::engine::tests::memory_engine;
  use crate::queue::QueueClass;
  use serde_json::json;

  #[test]
  fn test_percentage_is_capped() {
    assert_eq!(UsageEstimate::new(10, 15, 100).percentage, 25);
    assert_eq!(UsageEstimate::new(10, 500, 100).percentage, 100);
    assert_eq!(UsageEstimate::new(0, 0, 0).percentage, 0);
    assert_eq!(UsageEstimate::new(1, 1, 1000).total, 2);
  }

  #[tokio::test]
  async fn test_estimate_counts_mirror_and_store() {
    let engine = memory_engine();
    engine.initialize().await;
    let before = engine.cache_usage_estimate().await;
    assert!(before.mirror_bytes > 0);

    engine
      .save_items(vec![json!({ "item_code": "ABC123", "item_name": "Red Mug" })])
      .await;
    let after = engine.cache_usage_estimate().await;
    assert!(after.store_bytes > before.store_bytes);
    assert_eq!(after.total, after.mirror_bytes + after.store_bytes);
    assert!(after.percentage <= 100);
  }

  #[tokio::test]
  async fn test_reduce_keeps_queues_items_and_customers() {
    let engine = memory_engine();
    engine.initialize().await;
    engine
      .save_items(vec![json!({ "item_code": "ABC123", "item_name": "Red Mug" })])
      .await;
    engine.save_customers(vec![json!({ "name": "CUST-1" })]).await;
    engine
      .save_price_list_items(
        "Retail",
        &[PriceListItem {
          item_code: "ABC123".into(),
          rate: Some(2.0),
          price_list_rate: None,
        }],
      )
      .await;
    engine.enqueue(QueueClass::Invoice, "submit_invoice", json!({}));
    engine.save_offers(vec![json!({ "name": "10% off" })]);
    engine.save_item_uoms("ABC123", vec![json!({ "uom": "Box" })]);
    engine.set_print_template("<p/>");

    engine.reduce_cache_usage().await;

    assert_eq!(engine.queue_len(QueueClass::Invoice), 1);
    assert_eq!(engine.stored_items_count().await, 1);
    assert_eq!(engine.customers_count().await, 1);
    assert_eq!(engine.cached_price_list_items("Retail").await, None);
    assert!(engine.cached_offers().is_empty());
    assert!(engine.item_uoms("ABC123").is_empty());
    assert_eq!(engine.print_template(), "<p/>");
  }
}
