//! SQLite-backed store shared by every instance pointing at the same file.
//!
//! The evict → count → insert → refresh sequence runs inside one
//! `BEGIN IMMEDIATE` transaction, so concurrent instances serialize on the
//! database write lock rather than interleaving.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::errors::VigilResult;
use crate::models::ActivityRecord;
use crate::store::schema;
use crate::store::{Store, WindowSnapshot};

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> VigilResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        schema::init_schema(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, schema applied.
    pub fn open_in_memory() -> VigilResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn snapshot(conn: &Connection, key: &str, cutoff_us: i64) -> VigilResult<WindowSnapshot> {
    let (count, oldest_us, newest_us): (i64, Option<i64>, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), MIN(hit_us), MAX(hit_us) FROM rate_limit_hits \
         WHERE key = ?1 AND hit_us > ?2;",
        params![key, cutoff_us],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let expires_us: Option<i64> = conn
        .query_row(
            "SELECT expires_us FROM rate_limit_keys WHERE key = ?1;",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(WindowSnapshot {
        count: u32::try_from(count).unwrap_or(u32::MAX),
        oldest_us,
        newest_us,
        expires_us: if count > 0 { expires_us } else { None },
    })
}

/// Reclaim every key, with its hits, whose expiry is at or before `now_us`.
fn purge_expired(conn: &Connection, now_us: i64) -> VigilResult<usize> {
    conn.execute(
        "DELETE FROM rate_limit_hits WHERE key IN \
         (SELECT key FROM rate_limit_keys WHERE expires_us <= ?1);",
        params![now_us],
    )?;
    Ok(conn.execute(
        "DELETE FROM rate_limit_keys WHERE expires_us <= ?1;",
        params![now_us],
    )?)
}

impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn record_hit(
        &self,
        key: &str,
        now_us: i64,
        window_us: i64,
        ttl_us: i64,
    ) -> VigilResult<WindowSnapshot> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        purge_expired(&tx, now_us)?;
        let cutoff_us = now_us - window_us;
        tx.execute(
            "DELETE FROM rate_limit_hits WHERE key = ?1 AND hit_us <= ?2;",
            params![key, cutoff_us],
        )?;
        tx.execute(
            "INSERT INTO rate_limit_hits(key, hit_us) VALUES (?1, ?2);",
            params![key, now_us],
        )?;
        tx.execute(
            "INSERT INTO rate_limit_keys(key, expires_us) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET expires_us = excluded.expires_us;",
            params![key, now_us + ttl_us],
        )?;
        let snap = snapshot(&tx, key, cutoff_us)?;
        tx.commit()?;
        Ok(snap)
    }

    fn window_status(&self, key: &str, now_us: i64, window_us: i64) -> VigilResult<WindowSnapshot> {
        let conn = self.conn.lock();
        let live: bool = conn
            .query_row(
                "SELECT expires_us > ?2 FROM rate_limit_keys WHERE key = ?1;",
                params![key, now_us],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(false);
        if !live {
            return Ok(WindowSnapshot::default());
        }
        snapshot(&conn, key, now_us - window_us)
    }

    fn reset(&self, key: &str) -> VigilResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let hits = tx.execute("DELETE FROM rate_limit_hits WHERE key = ?1;", params![key])?;
        let keys = tx.execute("DELETE FROM rate_limit_keys WHERE key = ?1;", params![key])?;
        tx.commit()?;
        Ok(hits + keys > 0)
    }

    fn active_keys(&self, prefix: &str, now_us: i64, limit: usize) -> VigilResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key FROM rate_limit_keys \
             WHERE substr(key, 1, length(?1)) = ?1 AND expires_us > ?2 \
             ORDER BY key LIMIT ?3;",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![prefix, now_us, limit], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn append_activity(
        &self,
        identity: &str,
        day: &str,
        record: &ActivityRecord,
        expires_us: i64,
    ) -> VigilResult<()> {
        let payload = serde_json::to_string(record)?;
        let now_us = record.timestamp.timestamp_micros();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM activity_log WHERE expires_us <= ?1;",
            params![now_us],
        )?;
        tx.execute(
            "INSERT INTO activity_log(identity, day, payload_json, expires_us) \
             VALUES (?1, ?2, ?3, ?4);",
            params![identity, day, payload, expires_us],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn activities(&self, identity: &str, day: &str, now_us: i64) -> VigilResult<Vec<ActivityRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM activity_log \
             WHERE identity = ?1 AND day = ?2 AND expires_us > ?3 ORDER BY id;",
        )?;
        let rows = stmt.query_map(params![identity, day, now_us], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for payload in rows {
            let payload = payload?;
            // A row that no longer decodes is skipped rather than failing the read.
            match serde_json::from_str(&payload) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(identity, error = %e, "Skipping undecodable activity row"),
            }
        }
        Ok(records)
    }
}
