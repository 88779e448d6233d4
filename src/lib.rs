//! Offline persistence and sync engine for a point-of-sale register.
//!
//! [`Engine`] is the entry point: it owns the in-memory mirror, the SQLite
//! backed store, the offline queues and the reconciler that replays them.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod losses;
pub mod mirror;
pub mod queue;
pub mod sync;

pub use config::Config;
pub use engine::{Engine, InitReport, UsageEstimate};
pub use error::{Fault, Notice, RpcError};
pub use queue::{QueueClass, QueueEntry, SyncTotals};
pub use sync::{HttpRpc, RpcClient, SyncReport};

/// Cache schema version. Bump to invalidate every register's cache on upgrade.
pub const CACHE_VERSION: i64 = 1;

/// Hard ceiling on entries kept in each offline queue.
pub const MAX_QUEUE_ITEMS: usize = 1000;
