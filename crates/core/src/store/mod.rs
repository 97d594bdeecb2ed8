//! SQLite persistence layer for GitMirror.
//!
//! Provides a [`Store`] handle with WAL-mode journaling, automatic schema
//! migrations, and typed query helpers for the `mirrors`, `sync_attempts`,
//! and `mirror_leases` tables.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::StoreDsn;
use crate::errors::StoreError;

pub use queries::{LeaseCompletion, MirrorFilter};

/// Main store handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode and uses `PRAGMA foreign_keys = ON`
/// so mirror deletion cascades to history and leases. The inner connection is
/// wrapped in a `Mutex` so that `Store` is `Send + Sync`, enabling use inside
/// `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database selected by a resolved DSN.
    pub fn open(dsn: &StoreDsn) -> Result<Self, StoreError> {
        match dsn {
            StoreDsn::File(path) => Self::new(path),
            StoreDsn::Memory => Self::in_memory(),
        }
    }

    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!(path = %path.display(), "opening store");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("store opened with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), StoreError> {
        info!("initializing store schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("store schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Liveness check for the health probe.
    pub fn ping(&self) -> Result<(), StoreError> {
        let _: i64 = self.conn().query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(())
    }
}
