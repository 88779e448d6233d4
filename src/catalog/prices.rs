//! Cached price list rates.

use serde::{Deserialize, Serialize};

use crate::cache::{Cacheable, Table, TermField};

/// One rate for one item in one price list, stamped when it was cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
  pub price_list: String,
  pub item_code: String,
  #[serde(default)]
  pub rate: Option<f64>,
  #[serde(default)]
  pub price_list_rate: Option<f64>,
  /// Milliseconds since the Unix epoch
  pub timestamp: i64,
}

/// Rate row as received from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceListItem {
  pub item_code: String,
  #[serde(default)]
  pub rate: Option<f64>,
  #[serde(default)]
  pub price_list_rate: Option<f64>,
}

impl PriceRecord {
  pub fn new(price_list: &str, item: &PriceListItem, timestamp: i64) -> Self {
    Self {
      price_list: price_list.to_string(),
      item_code: item.item_code.clone(),
      rate: item.rate,
      price_list_rate: effective_list_rate(item.price_list_rate, item.rate),
      timestamp,
    }
  }

  pub fn key_for(price_list: &str, item_code: &str) -> String {
    format!("{}\u{1f}{}", price_list, item_code)
  }

  /// Fresh while strictly younger than `ttl_ms`.
  pub fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
    now_ms - self.timestamp < ttl_ms
  }
}

/// A zero or missing list rate falls back to the plain rate.
pub fn effective_list_rate(price_list_rate: Option<f64>, rate: Option<f64>) -> Option<f64> {
  match price_list_rate {
    Some(r) if r != 0.0 => Some(r),
    _ => rate,
  }
}

impl Cacheable for PriceRecord {
  fn cache_key(&self) -> String {
    Self::key_for(&self.price_list, &self.item_code)
  }

  fn table() -> Table {
    Table::ItemPrices
  }

  fn search_terms(&self) -> Vec<(TermField, String)> {
    vec![(TermField::PriceList, self.price_list.clone())]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_list_rate_defaults_to_rate() {
    let item = PriceListItem {
      item_code: "ABC123".into(),
      rate: Some(4.5),
      price_list_rate: None,
    };
    let record = PriceRecord::new("Standard Selling", &item, 1_000);
    assert_eq!(record.price_list_rate, Some(4.5));
    assert_eq!(record.cache_key(), "Standard Selling\u{1f}ABC123");

    assert_eq!(effective_list_rate(Some(0.0), Some(2.0)), Some(2.0));
    assert_eq!(effective_list_rate(Some(3.0), Some(2.0)), Some(3.0));
  }

  #[test]
  fn test_freshness_boundary() {
    let item = PriceListItem {
      item_code: "A".into(),
      rate: Some(1.0),
      price_list_rate: None,
    };
    let record = PriceRecord::new("P", &item, 0);
    assert!(record.is_fresh(999, 1_000));
    assert!(!record.is_fresh(1_000, 1_000));
  }
}
