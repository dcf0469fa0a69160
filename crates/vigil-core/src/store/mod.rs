//! Shared state behind the rate limiter and the activity ledger.
//!
//! Two backends implement [`Store`]: a SQLite file shared by every service
//! instance, and a process-local map for single-instance deployments and
//! tests. All timestamps are UTC microseconds.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::StoreConfig;
use crate::errors::VigilResult;
use crate::models::ActivityRecord;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// State of one request window after (or without) recording a hit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Live entries in the window.
    pub count: u32,
    pub oldest_us: Option<i64>,
    pub newest_us: Option<i64>,
    /// When the key expires from the store.
    pub expires_us: Option<i64>,
}

pub trait Store: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Atomically evict entries at or before `now_us - window_us`, insert
    /// `now_us`, refresh the key's expiry to `now_us + ttl_us` and return
    /// the post-insert window. Every key already expired at `now_us` is
    /// reclaimed in the same step.
    fn record_hit(
        &self,
        key: &str,
        now_us: i64,
        window_us: i64,
        ttl_us: i64,
    ) -> VigilResult<WindowSnapshot>;

    /// Read-only view of the live window.
    fn window_status(&self, key: &str, now_us: i64, window_us: i64) -> VigilResult<WindowSnapshot>;

    /// Drop a key. True when something was removed.
    fn reset(&self, key: &str) -> VigilResult<bool>;

    /// Unexpired keys starting with `prefix`, sorted, at most `limit`.
    fn active_keys(&self, prefix: &str, now_us: i64, limit: usize) -> VigilResult<Vec<String>>;

    /// Append to an identity's activity list for one UTC day.
    fn append_activity(
        &self,
        identity: &str,
        day: &str,
        record: &ActivityRecord,
        expires_us: i64,
    ) -> VigilResult<()>;

    /// Unexpired records for one identity and day, oldest first.
    fn activities(&self, identity: &str, day: &str, now_us: i64) -> VigilResult<Vec<ActivityRecord>>;
}

pub fn open_store(config: &StoreConfig) -> VigilResult<Arc<dyn Store>> {
    match config {
        StoreConfig::Shared {
            path,
            busy_timeout_ms,
        } => {
            let store = SqliteStore::open(path, Duration::from_millis(*busy_timeout_ms))?;
            info!(backend = "sqlite", path = %path.display(), "Opened shared store");
            Ok(Arc::new(store))
        }
        StoreConfig::Local => {
            info!(backend = "memory", "Using process-local store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
