//! Durable storage for the register's offline cache.
//!
//! This module provides:
//! - A lazily opened SQLite store with one table per destination
//! - Derived search terms for indexed lookups on multi-valued fields
//! - Chunked bulk writes and cursor-driven scans
//! - Degradation to a no-op store once the database is unusable
//! - The legacy flat store read during migration

pub mod legacy;
mod storage;
mod traits;

pub use legacy::LegacyStore;
pub use storage::{BulkPutReport, PersistentStore};
pub use traits::{Cacheable, Match, Table, TermField};
