//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The current schema
//! version is tracked in the SQLite `user_version` pragma.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StoreError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[(
    1,
    "initial schema",
    r#"
    CREATE TABLE IF NOT EXISTS mirrors (
        id                  TEXT PRIMARY KEY,
        name                TEXT    NOT NULL,
        upstream_url        TEXT    NOT NULL,
        downstream_owner    TEXT    NOT NULL DEFAULT '',
        downstream_name     TEXT    NOT NULL,
        enabled             INTEGER NOT NULL DEFAULT 1,
        sync_interval_secs  INTEGER,
        priority            INTEGER NOT NULL DEFAULT 0,
        last_attempt_at     TEXT,
        last_success_at     TEXT,
        last_status         TEXT    NOT NULL DEFAULT 'never'
                            CHECK (last_status IN ('never', 'success', 'failed', 'running')),
        last_error_summary  TEXT,
        size_mb             REAL    NOT NULL DEFAULT 0.0,
        created_at          TEXT    NOT NULL,
        updated_at          TEXT    NOT NULL,
        UNIQUE (downstream_owner, downstream_name)
    );

    CREATE INDEX IF NOT EXISTS idx_mirrors_enabled ON mirrors (enabled);

    CREATE TABLE IF NOT EXISTS sync_attempts (
        id                  TEXT PRIMARY KEY,
        mirror_id           TEXT    NOT NULL REFERENCES mirrors (id) ON DELETE CASCADE,
        trigger_kind        TEXT    NOT NULL
                            CHECK (trigger_kind IN ('scheduled', 'manual', 'retry')),
        outcome             TEXT
                            CHECK (outcome IN ('success', 'failed', 'cancelled', 'timeout')),
        stage_reached       TEXT    NOT NULL DEFAULT 'init',
        error_class         TEXT,
        error_detail        TEXT,
        bytes_transferred   INTEGER NOT NULL DEFAULT 0,
        refs_updated        INTEGER NOT NULL DEFAULT 0,
        started_at          TEXT    NOT NULL,
        finished_at         TEXT,
        CHECK (finished_at IS NULL OR finished_at >= started_at)
    );

    CREATE INDEX IF NOT EXISTS idx_sync_attempts_mirror ON sync_attempts (mirror_id, started_at);

    CREATE TABLE IF NOT EXISTS mirror_leases (
        mirror_id   TEXT PRIMARY KEY REFERENCES mirrors (id) ON DELETE CASCADE,
        holder_id   TEXT NOT NULL,
        prev_status TEXT NOT NULL,
        acquired_at TEXT NOT NULL,
        expires_at  TEXT NOT NULL
    );
    "#,
)];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking store migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, StoreError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), StoreError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        assert!(tables.contains(&"mirrors".to_string()));
        assert!(tables.contains(&"sync_attempts".to_string()));
        assert!(tables.contains(&"mirror_leases".to_string()));
    }

    #[test]
    fn test_finished_before_started_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO mirrors (id, name, upstream_url, downstream_name, created_at, updated_at)
             VALUES ('m1', 'demo', 'u', 'demo', '2025-01-01T00:00:00+00:00', '2025-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO sync_attempts (id, mirror_id, trigger_kind, started_at, finished_at)
             VALUES ('a1', 'm1', 'manual', '2025-01-02T00:00:00+00:00', '2025-01-01T00:00:00+00:00')",
            [],
        );
        assert!(result.is_err());
    }
}
