//! Startup, schema version self-heal and full invalidation.

use color_eyre::Result;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{absorb, Engine};
use crate::cache::Table;
use crate::error::{is_unavailable, Fault};
use crate::mirror::{HydrateReport, Slot};
use crate::CACHE_VERSION;

/// What happened during [`Engine::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
  /// False when the persistent store could not be reached
  pub healthy: bool,
  pub stored_version: Option<i64>,
  /// True when a version mismatch forced a full clear. Never set when the
  /// version could not be read.
  pub healed: bool,
  pub hydrated: HydrateReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invalidation {
  /// Delete the database files and reopen
  Soft,
  /// Empty every table in place
  Fast,
}

impl Engine {
  /// Check the store, heal a stale cache schema and hydrate the mirror.
  ///
  /// Runs to completion even when the store is down; the engine then serves
  /// from memory and reports itself degraded.
  pub async fn initialize(&self) -> InitReport {
    let mut report = InitReport {
      healthy: self.store.health_check().await,
      ..Default::default()
    };
    if !report.healthy {
      warn!("Persistent store unavailable, running from memory");
      self.losses.mark_degraded();
    }

    match self.stored_version().await {
      Ok(stored) if stored != Some(CACHE_VERSION) => {
        report.stored_version = stored;
        let mismatch = Fault::VersionMismatch {
          stored,
          expected: CACHE_VERSION,
        };
        info!("{}, clearing cache", mismatch);
        self.invalidate(Invalidation::Fast).await;
        report.healed = true;
      }
      Ok(stored) => report.stored_version = stored,
      Err(e) => warn!("Failed to read cache version, keeping cache as is: {}", e),
    }

    report.hydrated = self.mirror.hydrate(&self.store, &self.legacy).await;
    self.mirror.set(Slot::CacheReady, &true);
    report
  }

  /// Schema version recorded by the last run, from the store first and then
  /// the legacy flat store.
  ///
  /// An unavailable store defers to the legacy copy. Any other read error is
  /// returned, since a version that could not be read is not a mismatch.
  async fn stored_version(&self) -> Result<Option<i64>> {
    let key = Slot::CacheVersion.key();
    let stored = match self.store.get_raw(Table::Kv, key).await {
      Ok(raw) => raw.and_then(|raw| serde_json::from_str::<Value>(&raw).ok()),
      Err(e) if is_unavailable(&e) => None,
      Err(e) => return Err(e),
    };

    Ok(
      stored
        .or_else(|| self.legacy.get(key))
        .and_then(|value| parse_version(&value)),
    )
  }

  /// Destroy the database and start over from an empty cache.
  pub async fn clear_all_cache(&self) {
    self.invalidate(Invalidation::Soft).await;
  }

  /// Empty every table in place. Cheaper than [`Engine::clear_all_cache`].
  pub async fn force_clear_all_cache(&self) {
    self.invalidate(Invalidation::Fast).await;
  }

  async fn invalidate(&self, mode: Invalidation) {
    let ready = self.is_cache_ready();

    {
      let _pause = self.mirror.pause_persistence().await;
      match mode {
        Invalidation::Soft => absorb(
          self.store.destroy_and_reopen().await,
          "destroy cache database",
        ),
        Invalidation::Fast => absorb(self.store.clear_all().await, "clear cache tables"),
      }

      if let Err(e) = self.legacy.clear() {
        warn!("Failed to clear legacy store: {}", e);
      }
      self.mirror.reset();
      self.mirror.put_local(Slot::CacheReady, json!(ready));
    }

    self.write_version().await;
    info!(?mode, "Cache cleared");
  }

  async fn write_version(&self) {
    let key = Slot::CacheVersion.key();
    let version = json!(CACHE_VERSION);
    absorb(
      self
        .store
        .put_raw(Table::Kv, key, &version.to_string())
        .await,
      "write cache version",
    );
    if let Err(e) = self.legacy.set(key, &version) {
      warn!("Failed to write legacy cache version: {}", e);
    }
  }
}

/// Versions were written as numbers or as numeric strings.
fn parse_version(value: &Value) -> Option<i64> {
  match value {
    Value::Number(n) => n.as_i64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}
