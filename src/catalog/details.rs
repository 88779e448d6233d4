//! Per-item detail snapshots kept in the item details slot.
//!
//! Layout: `{ profile: { price_list: { item_code: { data, timestamp } } } }`.
//! Only the fields needed to sell offline are kept.

use serde::Serialize;
use serde_json::{json, Map, Value};

const DETAIL_FIELDS: [&str; 10] = [
  "item_code",
  "actual_qty",
  "has_batch_no",
  "has_serial_no",
  "item_uoms",
  "batch_no_data",
  "serial_no_data",
  "rate",
  "price_list_rate",
  "currency",
];

/// Result of a details lookup: fresh snapshots and codes that need fetching.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CachedDetails {
  pub cached: Vec<Value>,
  pub missing: Vec<String>,
}

/// Keep only the offline fields of a backend item.
fn strip(item: &Value) -> Option<(String, Value)> {
  let code = item.get("item_code")?.as_str()?.to_string();
  let data: Map<String, Value> = DETAIL_FIELDS
    .iter()
    .filter_map(|field| item.get(*field).map(|v| (field.to_string(), v.clone())))
    .collect();
  Some((code, Value::Object(data)))
}

/// The object under `key`, creating it (and turning `node` into an object) as needed.
fn child<'a>(node: &'a mut Value, key: &str) -> &'a mut Value {
  if !node.is_object() {
    *node = json!({});
  }
  let slot = &mut node[key];
  if !slot.is_object() {
    *slot = json!({});
  }
  slot
}

/// Stamp `items` into the cache under `profile`/`price_list`. Returns how many
/// items were stored.
pub fn store(cache: &mut Value, profile: &str, price_list: &str, items: &[Value], now_ms: i64) -> usize {
  let Value::Object(bucket) = child(child(cache, profile), price_list) else {
    return 0;
  };
  let mut stored = 0;
  for (code, data) in items.iter().filter_map(strip) {
    bucket.insert(code, json!({ "data": data, "timestamp": now_ms }));
    stored += 1;
  }
  stored
}

/// Split `codes` into fresh cached snapshots and missing codes.
pub fn lookup(
  cache: &Value,
  profile: &str,
  price_list: &str,
  codes: &[String],
  ttl_ms: i64,
  now_ms: i64,
) -> CachedDetails {
  let bucket = cache.get(profile).and_then(|p| p.get(price_list));
  let mut details = CachedDetails::default();

  for code in codes {
    let entry = bucket.and_then(|b| b.get(code));
    let fresh = entry
      .and_then(|e| e.get("timestamp"))
      .and_then(Value::as_i64)
      .map(|stamp| now_ms - stamp < ttl_ms)
      .unwrap_or(false);

    match entry.and_then(|e| e.get("data")) {
      Some(data) if fresh => details.cached.push(data.clone()),
      _ => details.missing.push(code.clone()),
    }
  }
  details
}

/// Overlay a snapshot on its base item; snapshot fields win.
pub fn merge_over(base: Value, snapshot: &Value) -> Value {
  let mut merged = match base {
    Value::Object(map) => map,
    _ => Map::new(),
  };
  if let Value::Object(fields) = snapshot {
    for (k, v) in fields {
      merged.insert(k.clone(), v.clone());
    }
  }
  Value::Object(merged)
}
