//! SQLite schema DDL and migrations for the shared store.

use rusqlite::Connection;

use crate::errors::VigilResult;

/// Current schema version. Migrations run from whatever the database
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Base DDL, safe to replay on an initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS rate_limit_keys (
        key TEXT PRIMARY KEY,
        expires_us INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS rate_limit_hits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        hit_us INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS activity_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity TEXT NOT NULL,
        day TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        expires_us INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE INDEX IF NOT EXISTS idx_hits_key_time ON rate_limit_hits(key, hit_us);",
    "CREATE INDEX IF NOT EXISTS idx_activity_identity_day ON activity_log(identity, day, id);",
];

/// Create the base tables, then run pending migrations.
pub fn init_schema(conn: &Connection) -> VigilResult<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    migrate_schema(conn)
}

/// Each step runs inside a SAVEPOINT so a failure rolls back only that step.
pub fn migrate_schema(conn: &Connection) -> VigilResult<()> {
    let mut current_version = get_schema_version(conn);
    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT vigil_migrate_step;")?;
        let step_result = (|| -> VigilResult<()> {
            match next_version {
                1 => {}
                2 => migrate_to_v2(conn)?,
                _ => {}
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT vigil_migrate_step;")?;
            Ok(())
        })();
        match step_result {
            Ok(()) => current_version = next_version,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT vigil_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT vigil_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: i32) -> VigilResult<()> {
    conn.execute(
        "INSERT INTO store_meta(key, value) VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> VigilResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

/// v1 -> v2: expiry indexes so retention sweeps stay off full scans.
fn migrate_to_v2(conn: &Connection) -> VigilResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_activity_expires ON activity_log(expires_us);",
    )?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_keys_expires ON rate_limit_keys(expires_us);",
    )?;
    Ok(())
}
