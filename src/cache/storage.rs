//! Persistent store: lazily opened SQLite tables behind an async facade.
//!
//! All operations serialize through one connection lock. Once the database
//! cannot be opened, or the health check exhausts its retries, the store is
//! marked unavailable and every call short-circuits with
//! [`Fault::StorageUnavailable`] instead of blocking.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::traits::{Cacheable, Match, Table, TermField};
use crate::config::StoreConfig;
use crate::db::{self, Database, Location};
use crate::error::Fault;
use crate::CACHE_VERSION;

/// Outcome of a chunked bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkPutReport {
  pub rows: usize,
  /// Number of storage transactions committed
  pub transactions: usize,
}

enum State {
  Closed,
  Open(Database),
}

pub struct PersistentStore {
  location: Location,
  settings: StoreConfig,
  state: Mutex<State>,
  broken: AtomicBool,
}

impl PersistentStore {
  /// Create a store handle. Nothing is opened until first use.
  pub fn new(location: Location, settings: StoreConfig) -> Self {
    Self {
      location,
      settings,
      state: Mutex::new(State::Closed),
      broken: AtomicBool::new(false),
    }
  }

  pub fn location(&self) -> &Location {
    &self.location
  }

  pub fn is_available(&self) -> bool {
    !self.broken.load(Ordering::Acquire)
  }

  fn mark_broken(&self) {
    self.broken.store(true, Ordering::Release);
  }

  /// Open the database if it is not open yet. Idempotent.
  pub async fn open(&self) -> Result<()> {
    self.with_conn(|_| Ok(())).await
  }

  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Connection) -> Result<T>,
  {
    if !self.is_available() {
      return Err(Fault::StorageUnavailable.into());
    }

    let mut state = self.state.lock().await;
    if let State::Closed = *state {
      *state = State::Open(self.open_with_retry().await?);
    }

    match &*state {
      State::Open(db) => f(db.conn()),
      State::Closed => Err(Fault::StorageUnavailable.into()),
    }
  }

  async fn open_with_retry(&self) -> Result<Database> {
    let attempts = self.settings.open_retries.max(1);
    let mut delay = self.settings.retry_backoff();

    for attempt in 1..=attempts {
      match Database::open(&self.location) {
        Ok(db) => {
          debug!(attempt, "Opened cache database");
          return Ok(db);
        }
        Err(e) => {
          warn!(attempt, attempts, "Failed to open cache database: {}", e);
          if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
          }
        }
      }
    }

    error!("Cache database could not be opened, marking store unavailable");
    self.mark_broken();
    Err(Fault::StorageUnavailable.into())
  }

  /// Probe the database, retrying with backoff.
  ///
  /// Returns false and marks the store unavailable once retries are exhausted.
  pub async fn health_check(&self) -> bool {
    let retries = self.settings.health_retries;
    let mut delay = self.settings.retry_backoff();

    for attempt in 0..=retries {
      if !self.is_available() {
        return false;
      }

      let probe = self
        .with_conn(|conn| {
          conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| eyre!("Health probe failed: {}", e))
        })
        .await;

      match probe {
        Ok(_) => return true,
        Err(e) => {
          warn!(attempt, "Cache health check failed: {}", e);
          if attempt < retries {
            tokio::time::sleep(delay).await;
            delay *= 2;
          }
        }
      }
    }

    error!("Cache health check exhausted retries, marking store unavailable");
    self.mark_broken();
    false
  }

  /// Write records in chunks, one transaction per chunk.
  ///
  /// The connection lock is released between chunks so a large ingest never
  /// holds the store for its whole duration.
  pub async fn bulk_put<T: Cacheable>(&self, rows: &[T], chunk_size: usize) -> Result<BulkPutReport> {
    let table = T::table();
    let mut report = BulkPutReport::default();

    for chunk in rows.chunks(chunk_size.max(1)) {
      let written = self
        .with_conn(|conn| write_chunk(conn, table, chunk))
        .await?;
      report.rows += written;
      report.transactions += 1;
    }

    debug!(
      table = table.name(),
      rows = report.rows,
      transactions = report.transactions,
      "Bulk write committed"
    );
    Ok(report)
  }

  /// Store a pre-serialized document under `key`.
  pub async fn put_raw(&self, table: Table, key: &str, data: &str) -> Result<()> {
    self
      .with_conn(|conn| {
        conn
          .execute(&upsert_sql(table), params![key, data, CACHE_VERSION])
          .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
        Ok(())
      })
      .await
  }

  /// Read the raw JSON document stored under `key`.
  pub async fn get_raw(&self, table: Table, key: &str) -> Result<Option<String>> {
    self
      .with_conn(|conn| {
        conn
          .query_row(
            &format!("SELECT data FROM {} WHERE key = ?1", table.name()),
            params![key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read {}: {}", key, e))
      })
      .await
  }

  /// Get a single record by key.
  pub async fn get<T: Cacheable>(&self, key: &str) -> Result<Option<T>> {
    match self.get_raw(T::table(), key).await? {
      Some(data) => {
        let record = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize {}: {}", key, e))?;
        Ok(Some(record))
      }
      None => Ok(None),
    }
  }

  /// Get records for `keys`, in the order given. Missing keys are skipped.
  pub async fn get_many<T: Cacheable>(&self, keys: &[String]) -> Result<Vec<T>> {
    let table = T::table();
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare(&format!("SELECT data FROM {} WHERE key = ?1", table.name()))
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
          let data: Option<String> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?;
          if let Some(data) = data {
            match serde_json::from_str::<T>(&data) {
              Ok(record) => records.push(record),
              Err(e) => warn!(key = %key, "Skipping undecodable row: {}", e),
            }
          }
        }
        Ok(records)
      })
      .await
  }

  /// Keys whose derived `field` term matches `term`, ordered by key.
  pub async fn lookup(
    &self,
    table: Table,
    field: TermField,
    matching: Match,
    term: &str,
  ) -> Result<Vec<String>> {
    self
      .with_conn(|conn| {
        let keys = match matching {
          Match::Exact => {
            let mut stmt = conn.prepare(
              "SELECT key FROM search_terms
               WHERE tbl = ?1 AND field = ?2 AND term = ?3
               ORDER BY key",
            )?;
            let keys = stmt
              .query_map(params![table.name(), field.as_str(), term], |row| row.get(0))?
              .collect::<rusqlite::Result<Vec<String>>>()?;
            keys
          }
          Match::Prefix => {
            // Range scan keeps the primary key index usable
            let upper = format!("{}{}", term, char::MAX);
            let mut stmt = conn.prepare(
              "SELECT DISTINCT key FROM search_terms
               WHERE tbl = ?1 AND field = ?2 AND term >= ?3 AND term < ?4
               ORDER BY key",
            )?;
            let keys = stmt
              .query_map(
                params![table.name(), field.as_str(), term, upper],
                |row| row.get(0),
              )?
              .collect::<rusqlite::Result<Vec<String>>>()?;
            keys
          }
        };
        Ok(keys)
      })
      .await
  }

  /// Cursor scan over a table, keeping records accepted by `predicate`.
  ///
  /// Rows are decoded one at a time; the table is never loaded whole.
  pub async fn range_query<T, F>(&self, predicate: F, offset: usize, limit: usize) -> Result<Vec<T>>
  where
    T: Cacheable,
    F: Fn(&T) -> bool + Send,
  {
    let table = T::table();
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare(&format!("SELECT key, data FROM {} ORDER BY key", table.name()))
          .map_err(|e| eyre!("Failed to prepare scan: {}", e))?;
        let mut rows = stmt.query([])?;

        let mut skipped = 0;
        let mut records = Vec::new();
        while records.len() < limit {
          let Some(row) = rows.next()? else {
            break;
          };
          let data: String = row.get(1)?;
          let record: T = match serde_json::from_str(&data) {
            Ok(record) => record,
            Err(e) => {
              let key: String = row.get(0)?;
              warn!(key = %key, "Skipping undecodable row: {}", e);
              continue;
            }
          };
          if !predicate(&record) {
            continue;
          }
          if skipped < offset {
            skipped += 1;
            continue;
          }
          records.push(record);
        }
        Ok(records)
      })
      .await
  }

  pub async fn count(&self, table: Table) -> Result<u64> {
    self
      .with_conn(|conn| {
        let count: i64 = conn
          .query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |row| {
            row.get(0)
          })
          .map_err(|e| eyre!("Failed to count {}: {}", table.name(), e))?;
        Ok(count as u64)
      })
      .await
  }

  /// Delete specific records and their derived terms.
  pub async fn delete(&self, table: Table, keys: &[String]) -> Result<usize> {
    self
      .with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let mut deleted = 0;
        {
          let mut delete_row =
            tx.prepare(&format!("DELETE FROM {} WHERE key = ?1", table.name()))?;
          let mut delete_terms =
            tx.prepare("DELETE FROM search_terms WHERE tbl = ?1 AND key = ?2")?;
          for key in keys {
            deleted += delete_row.execute(params![key])?;
            delete_terms.execute(params![table.name(), key])?;
          }
        }
        tx.commit()
          .map_err(|e| eyre!("Failed to commit delete: {}", e))?;
        Ok(deleted)
      })
      .await
  }

  /// Empty one table and its derived terms.
  pub async fn clear(&self, table: Table) -> Result<()> {
    self
      .with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(&format!("DELETE FROM {}", table.name()), [])?;
        tx.execute(
          "DELETE FROM search_terms WHERE tbl = ?1",
          params![table.name()],
        )?;
        tx.commit()
          .map_err(|e| eyre!("Failed to clear {}: {}", table.name(), e))?;
        Ok(())
      })
      .await
  }

  /// Empty every table in place, in a single transaction.
  pub async fn clear_all(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        for table in Table::ALL {
          tx.execute(&format!("DELETE FROM {}", table.name()), [])?;
        }
        tx.execute("DELETE FROM search_terms", [])?;
        tx.commit()
          .map_err(|e| eyre!("Failed to clear cache tables: {}", e))?;
        Ok(())
      })
      .await
  }

  /// Close the connection, delete the database files and open a fresh one.
  ///
  /// A successful reopen also clears the unavailable mark.
  pub async fn destroy_and_reopen(&self) -> Result<()> {
    let mut state = self.state.lock().await;

    // Drop the connection before touching the files
    *state = State::Closed;
    if let Location::File(path) = &self.location {
      db::remove_files(path)?;
    }

    self.broken.store(false, Ordering::Release);
    *state = State::Open(self.open_with_retry().await?);
    info!("Cache database destroyed and reopened");
    Ok(())
  }

  /// Sum of serialized row sizes in a table, via a cursor scan.
  pub async fn scan_bytes(&self, table: Table) -> Result<u64> {
    self
      .with_conn(|conn| {
        let mut stmt = conn.prepare(&format!("SELECT key, data FROM {}", table.name()))?;
        let mut rows = stmt.query([])?;
        let mut total = 0u64;
        while let Some(row) = rows.next()? {
          let key: String = row.get(0)?;
          let data: String = row.get(1)?;
          total += (key.len() + data.len()) as u64;
        }
        Ok(total)
      })
      .await
  }

  /// Sum of derived term sizes, via a cursor scan.
  pub async fn scan_term_bytes(&self) -> Result<u64> {
    self
      .with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT tbl, field, term, key FROM search_terms")?;
        let mut rows = stmt.query([])?;
        let mut total = 0u64;
        while let Some(row) = rows.next()? {
          for idx in 0..4 {
            let value: String = row.get(idx)?;
            total += value.len() as u64;
          }
        }
        Ok(total)
      })
      .await
  }
}

fn upsert_sql(table: Table) -> String {
  format!(
    "INSERT OR REPLACE INTO {} (key, data, schema_version, cached_at)
     VALUES (?1, ?2, ?3, datetime('now'))",
    table.name()
  )
}

fn write_chunk<T: Cacheable>(conn: &Connection, table: Table, chunk: &[T]) -> Result<usize> {
  let tx = conn
    .unchecked_transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

  let mut written = 0;
  {
    let mut insert = tx
      .prepare(&upsert_sql(table))
      .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;
    let mut clear_terms = tx.prepare("DELETE FROM search_terms WHERE tbl = ?1 AND key = ?2")?;
    let mut insert_term = tx.prepare(
      "INSERT OR IGNORE INTO search_terms (tbl, field, term, key) VALUES (?1, ?2, ?3, ?4)",
    )?;

    for row in chunk {
      let key = row.cache_key();
      let data = match serde_json::to_string(row) {
        Ok(data) => data,
        Err(e) => {
          warn!(key = %key, "Skipping record that is not plain data: {}", e);
          continue;
        }
      };

      insert
        .execute(params![key, data, CACHE_VERSION])
        .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
      clear_terms.execute(params![table.name(), key])?;
      for (field, term) in row.search_terms() {
        insert_term.execute(params![table.name(), field.as_str(), term, key])?;
      }
      written += 1;
    }
  }

  tx.commit()
    .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
  Ok(written)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::is_unavailable;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Sku {
    code: String,
    tags: Vec<String>,
  }

  impl Cacheable for Sku {
    fn cache_key(&self) -> String {
      self.code.clone()
    }

    fn table() -> Table {
      Table::Items
    }

    fn search_terms(&self) -> Vec<(TermField, String)> {
      let mut terms = vec![(TermField::Code, self.code.to_lowercase())];
      terms.extend(self.tags.iter().map(|t| (TermField::Keyword, t.clone())));
      terms
    }
  }

  fn sku(code: &str, tags: &[&str]) -> Sku {
    Sku {
      code: code.to_string(),
      tags: tags.iter().map(|t| t.to_string()).collect(),
    }
  }

  fn fast_settings() -> StoreConfig {
    StoreConfig {
      open_retries: 2,
      health_retries: 1,
      retry_backoff_ms: 1,
    }
  }

  fn memory_store() -> PersistentStore {
    PersistentStore::new(Location::Memory, fast_settings())
  }

  #[tokio::test]
  async fn test_bulk_put_chunks_into_transactions() {
    let store = memory_store();
    let rows: Vec<Sku> = (0..2500).map(|i| sku(&format!("SKU{:05}", i), &[])).collect();

    let report = store.bulk_put(&rows, 1000).await.unwrap();

    assert_eq!(report.transactions, 3);
    assert_eq!(report.rows, 2500);
    assert_eq!(store.count(Table::Items).await.unwrap(), 2500);
  }

  #[tokio::test]
  async fn test_open_is_idempotent() {
    let store = memory_store();
    store.put_raw(Table::Kv, "k", "1").await.unwrap();
    store.open().await.unwrap();
    store.open().await.unwrap();
    // Same connection, data still there
    assert_eq!(
      store.get_raw(Table::Kv, "k").await.unwrap(),
      Some("1".to_string())
    );
  }

  #[tokio::test]
  async fn test_lookup_exact_and_prefix() {
    let store = memory_store();
    store
      .bulk_put(
        &[sku("ABC1", &["red", "mug"]), sku("ABD2", &["reddish"]), sku("X9", &[])],
        1000,
      )
      .await
      .unwrap();

    let exact = store
      .lookup(Table::Items, TermField::Keyword, Match::Exact, "red")
      .await
      .unwrap();
    assert_eq!(exact, vec!["ABC1".to_string()]);

    let prefix = store
      .lookup(Table::Items, TermField::Keyword, Match::Prefix, "red")
      .await
      .unwrap();
    assert_eq!(prefix, vec!["ABC1".to_string(), "ABD2".to_string()]);

    let codes = store
      .lookup(Table::Items, TermField::Code, Match::Prefix, "ab")
      .await
      .unwrap();
    assert_eq!(codes.len(), 2);
  }

  #[tokio::test]
  async fn test_rewrite_replaces_terms() {
    let store = memory_store();
    store.bulk_put(&[sku("A", &["old"])], 10).await.unwrap();
    store.bulk_put(&[sku("A", &["new"])], 10).await.unwrap();

    let old = store
      .lookup(Table::Items, TermField::Keyword, Match::Exact, "old")
      .await
      .unwrap();
    assert!(old.is_empty());
    assert_eq!(store.count(Table::Items).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_range_query_offset_and_limit() {
    let store = memory_store();
    let rows: Vec<Sku> = (0..10).map(|i| sku(&format!("S{}", i), &[])).collect();
    store.bulk_put(&rows, 4).await.unwrap();

    let page: Vec<Sku> = store.range_query(|_| true, 3, 4).await.unwrap();
    let codes: Vec<_> = page.iter().map(|s| s.code.as_str()).collect();
    assert_eq!(codes, vec!["S3", "S4", "S5", "S6"]);

    let filtered: Vec<Sku> = store
      .range_query(|s: &Sku| s.code.ends_with('7'), 0, 100)
      .await
      .unwrap();
    assert_eq!(filtered.len(), 1);
  }

  #[tokio::test]
  async fn test_get_many_preserves_order_and_skips_missing() {
    let store = memory_store();
    store
      .bulk_put(&[sku("A", &[]), sku("B", &[]), sku("C", &[])], 10)
      .await
      .unwrap();

    let keys = vec!["C".to_string(), "missing".to_string(), "A".to_string()];
    let found: Vec<Sku> = store.get_many(&keys).await.unwrap();
    let codes: Vec<_> = found.iter().map(|s| s.code.as_str()).collect();
    assert_eq!(codes, vec!["C", "A"]);
  }

  #[tokio::test]
  async fn test_clear_removes_rows_and_terms() {
    let store = memory_store();
    store.bulk_put(&[sku("A", &["tag"])], 10).await.unwrap();
    store.put_raw(Table::Kv, "keep", "true").await.unwrap();

    store.clear(Table::Items).await.unwrap();

    assert_eq!(store.count(Table::Items).await.unwrap(), 0);
    assert_eq!(store.scan_term_bytes().await.unwrap(), 0);
    assert_eq!(store.count(Table::Kv).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_destroy_and_reopen_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = PersistentStore::new(Location::in_dir(dir.path()), fast_settings());
    store.bulk_put(&[sku("A", &[])], 10).await.unwrap();
    store.put_raw(Table::Kv, "cache_version", "1").await.unwrap();

    store.destroy_and_reopen().await.unwrap();

    assert_eq!(store.count(Table::Items).await.unwrap(), 0);
    assert_eq!(store.get_raw(Table::Kv, "cache_version").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_unopenable_store_degrades() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let store = PersistentStore::new(
      Location::File(blocker.join("cache.db")),
      fast_settings(),
    );

    assert!(!store.health_check().await);
    assert!(!store.is_available());

    let err = store.count(Table::Items).await.unwrap_err();
    assert!(is_unavailable(&err));
  }

  #[tokio::test]
  async fn test_scan_bytes_counts_rows() {
    let store = memory_store();
    assert_eq!(store.scan_bytes(Table::Kv).await.unwrap(), 0);

    store.put_raw(Table::Kv, "abc", "12345").await.unwrap();
    assert_eq!(store.scan_bytes(Table::Kv).await.unwrap(), 8);
  }
}
