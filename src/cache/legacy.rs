//! Legacy flat key/value store.
//!
//! Older registers kept every slot as a `posa_`-prefixed JSON string in a flat
//! file. It is only read as a migration fallback during hydration and for the
//! cache schema version, and it is wiped on every full invalidation.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

const PREFIX: &str = "posa_";

pub struct LegacyStore {
  /// None keeps the store purely in memory
  path: Option<PathBuf>,
  entries: Mutex<BTreeMap<String, String>>,
}

impl LegacyStore {
  /// Load the flat store from `path`. A missing or corrupt file yields an empty store.
  pub fn load(path: Option<PathBuf>) -> Self {
    let entries = path
      .as_deref()
      .map(Self::read_file)
      .unwrap_or_default();

    Self {
      path,
      entries: Mutex::new(entries),
    }
  }

  /// The default flat store file inside a data directory.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("legacy.json")
  }

  fn read_file(path: &Path) -> BTreeMap<String, String> {
    let contents = match std::fs::read_to_string(path) {
      Ok(contents) => contents,
      Err(_) => return BTreeMap::new(),
    };

    match serde_json::from_str(&contents) {
      Ok(entries) => entries,
      Err(e) => {
        warn!("Ignoring unreadable legacy store {}: {}", path.display(), e);
        BTreeMap::new()
      }
    }
  }

  /// Parsed value stored for `key`, if any.
  pub fn get(&self, key: &str) -> Option<Value> {
    let entries = self.entries.lock().ok()?;
    let raw = entries.get(&format!("{}{}", PREFIX, key))?;
    match serde_json::from_str(raw) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key, "Failed to parse legacy value: {}", e);
        None
      }
    }
  }

  pub fn set(&self, key: &str, value: &Value) -> Result<()> {
    {
      let mut entries = self
        .entries
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      entries.insert(format!("{}{}", PREFIX, key), value.to_string());
    }
    self.save()
  }

  /// Remove every prefixed entry.
  pub fn clear(&self) -> Result<()> {
    {
      let mut entries = self
        .entries
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      entries.retain(|k, _| !k.starts_with(PREFIX));
    }
    self.save()
  }

  /// Serialized size of every prefixed entry.
  pub fn bytes(&self) -> u64 {
    match self.entries.lock() {
      Ok(entries) => entries
        .iter()
        .filter(|(k, _)| k.starts_with(PREFIX))
        .map(|(k, v)| (k.len() + v.len()) as u64)
        .sum(),
      Err(_) => 0,
    }
  }

  fn save(&self) -> Result<()> {
    let Some(path) = &self.path else {
      return Ok(());
    };

    let contents = {
      let entries = self
        .entries
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      serde_json::to_string(&*entries)?
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create legacy store directory: {}", e))?;
    }

    // Write to a sibling then rename so a crash never leaves half a file
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)
      .map_err(|e| eyre!("Failed to write legacy store {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, path)
      .map_err(|e| eyre!("Failed to replace legacy store {}: {}", path.display(), e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_values_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = LegacyStore::default_path(dir.path());

    let store = LegacyStore::load(Some(path.clone()));
    store.set("cache_version", &json!(1)).unwrap();
    store.set("print_template", &json!("<div/>")).unwrap();

    let reloaded = LegacyStore::load(Some(path));
    assert_eq!(reloaded.get("cache_version"), Some(json!(1)));
    assert_eq!(reloaded.get("print_template"), Some(json!("<div/>")));
    assert_eq!(reloaded.get("missing"), None);
  }

  #[test]
  fn test_clear_only_drops_prefixed_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = LegacyStore::default_path(dir.path());
    std::fs::write(&path, r#"{"posa_manual_offline":"true","other":"1"}"#).unwrap();

    let store = LegacyStore::load(Some(path));
    assert_eq!(store.get("manual_offline"), Some(json!(true)));
    assert!(store.bytes() > 0);

    store.clear().unwrap();
    assert_eq!(store.get("manual_offline"), None);
    assert_eq!(store.bytes(), 0);
  }

  #[test]
  fn test_corrupt_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = LegacyStore::default_path(dir.path());
    std::fs::write(&path, "not json").unwrap();

    let store = LegacyStore::load(Some(path));
    assert_eq!(store.bytes(), 0);
  }
}
