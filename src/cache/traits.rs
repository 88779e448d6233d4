//! Core traits and types for the persistent store.

use serde::{de::DeserializeOwned, Serialize};

/// Destination tables. Every table has the same (key, data) row shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
  /// Scalar mirror slots
  Kv,
  /// Offline mutation queue slots
  Queues,
  Items,
  Customers,
  ItemPrices,
}

impl Table {
  pub const ALL: [Table; 5] = [
    Table::Kv,
    Table::Queues,
    Table::Items,
    Table::Customers,
    Table::ItemPrices,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Table::Kv => "kv",
      Table::Queues => "queues",
      Table::Items => "items",
      Table::Customers => "customers",
      Table::ItemPrices => "item_prices",
    }
  }
}

/// Derived lookup fields stored in `search_terms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermField {
  Code,
  Name,
  Keyword,
  Barcode,
  Serial,
  Batch,
  Group,
  PriceList,
}

impl TermField {
  pub fn as_str(self) -> &'static str {
    match self {
      TermField::Code => "code",
      TermField::Name => "name",
      TermField::Keyword => "keyword",
      TermField::Barcode => "barcode",
      TermField::Serial => "serial",
      TermField::Batch => "batch",
      TermField::Group => "group",
      TermField::PriceList => "price_list",
    }
  }
}

/// How a term lookup compares against stored terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
  Exact,
  Prefix,
}

/// Trait for records that live in a dedicated table.
///
/// Implementors provide a unique key and, optionally, the derived terms used
/// for indexed lookups.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier within the table (e.g., item code, customer name)
  fn cache_key(&self) -> String;

  /// Table the record is stored in
  fn table() -> Table;

  /// Derived lookup terms written alongside the record.
  fn search_terms(&self) -> Vec<(TermField, String)> {
    Vec::new()
  }
}
