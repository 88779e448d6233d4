//! Catalog record types and the lookup terms derived from them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::cache::{Cacheable, Table, TermField};

/// Treat an explicit JSON `null` like a missing field.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Default + Deserialize<'de>,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A sellable item. Fields the register does not interpret are kept in `extra`
/// and written back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
  pub item_code: String,
  #[serde(default, deserialize_with = "null_default")]
  pub item_name: String,
  #[serde(default, deserialize_with = "null_default")]
  pub item_group: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub actual_qty: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rate: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub price_list_rate: Option<f64>,

  // Derived on ingest
  #[serde(default, deserialize_with = "null_default")]
  pub barcodes: Vec<String>,
  #[serde(default, deserialize_with = "null_default")]
  pub name_keywords: Vec<String>,
  #[serde(default, deserialize_with = "null_default")]
  pub serials: Vec<String>,
  #[serde(default, deserialize_with = "null_default")]
  pub batches: Vec<String>,

  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl ItemRecord {
  /// Parse a raw backend item and derive its lookup fields.
  pub fn from_raw(raw: Value) -> Result<Self, serde_json::Error> {
    let mut item: ItemRecord = serde_json::from_value(raw)?;
    item.derive_fields();
    Ok(item)
  }

  /// Recompute barcodes, keywords, serials and batches from the raw fields.
  pub fn derive_fields(&mut self) {
    self.barcodes = match self.extra.get("item_barcode") {
      Some(Value::Array(rows)) => collect_field(rows, "barcode"),
      Some(Value::String(code)) if !code.is_empty() => vec![code.clone()],
      Some(Value::Number(code)) => vec![code.to_string()],
      _ => Vec::new(),
    };

    self.name_keywords = self
      .item_name
      .to_lowercase()
      .split_whitespace()
      .map(String::from)
      .collect();

    self.serials = match self.extra.get("serial_no_data") {
      Some(Value::Array(rows)) => collect_field(rows, "serial_no"),
      _ => Vec::new(),
    };

    self.batches = match self.extra.get("batch_no_data") {
      Some(Value::Array(rows)) => collect_field(rows, "batch_no"),
      _ => Vec::new(),
    };
  }

  /// `group` must already be lower-cased; None matches every item.
  pub fn in_group(&self, group: Option<&str>) -> bool {
    match group {
      Some(group) => self.item_group.to_lowercase() == group,
      None => true,
    }
  }

  /// Substring match on code and name, exact match on barcodes, serials and
  /// batches. A scalar barcode is matched by substring. `term` must be lower-cased.
  pub fn matches_text(&self, term: &str) -> bool {
    let contains = |field: &str| field.to_lowercase().contains(term);
    let equals = |values: &[String]| values.iter().any(|v| v.to_lowercase() == term);

    let barcode = if self.has_scalar_barcode() {
      self.barcodes.iter().any(|b| contains(b))
    } else {
      equals(&self.barcodes)
    };

    contains(&self.item_name)
      || contains(&self.item_code)
      || barcode
      || equals(&self.serials)
      || equals(&self.batches)
  }

  fn has_scalar_barcode(&self) -> bool {
    matches!(
      self.extra.get("item_barcode"),
      Some(Value::String(_)) | Some(Value::Number(_))
    )
  }
}

fn collect_field(rows: &[Value], field: &str) -> Vec<String> {
  rows
    .iter()
    .filter_map(|row| match row.get(field) {
      Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
      Some(Value::Number(n)) => Some(n.to_string()),
      _ => None,
    })
    .collect()
}

impl Cacheable for ItemRecord {
  fn cache_key(&self) -> String {
    self.item_code.clone()
  }

  fn table() -> Table {
    Table::Items
  }

  fn search_terms(&self) -> Vec<(TermField, String)> {
    let mut terms = vec![(TermField::Code, self.item_code.to_lowercase())];
    if !self.item_name.is_empty() {
      terms.push((TermField::Name, self.item_name.to_lowercase()));
    }
    if !self.item_group.is_empty() {
      terms.push((TermField::Group, self.item_group.to_lowercase()));
    }
    terms.extend(
      self
        .name_keywords
        .iter()
        .map(|k| (TermField::Keyword, k.to_lowercase())),
    );
    terms.extend(
      self
        .barcodes
        .iter()
        .map(|b| (TermField::Barcode, b.to_lowercase())),
    );
    terms.extend(self.serials.iter().map(|s| (TermField::Serial, s.to_lowercase())));
    terms.extend(self.batches.iter().map(|b| (TermField::Batch, b.to_lowercase())));
    terms
  }
}

/// A customer as kept offline. Any other field of the backend document is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub customer_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mobile_no: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub primary_address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tax_id: Option<String>,
}

impl Cacheable for CustomerRecord {
  fn cache_key(&self) -> String {
    self.name.clone()
  }

  fn table() -> Table {
    Table::Customers
  }
}
