use crate::storage::errors::{Result, StorageError};
use crate::storage::schema;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Main database interface: one rusqlite connection behind a mutex, shared
/// by the worker tasks and the CLI. Operations are short, so serializing
/// them on one connection keeps the single-writer discipline without a
/// pool.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at the given path and bring the
    /// schema up to date.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::database_path_error(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let conn = Self::create_optimized_connection(db_path)?;
        let database = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        database.run_migrations()?;
        Ok(database)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let database = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        database.run_migrations()?;
        Ok(database)
    }

    /// Create a connection with optimal SQLite settings. WAL keeps every
    /// committed mutation durable across a process crash, which the outbox
    /// contract depends on.
    fn create_optimized_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "memory")?;
        Ok(conn)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        schema::initialize_schema(&conn)
    }

    /// Execute a closure with access to the connection.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Execute a closure inside a transaction with automatic rollback on
    /// error.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        let tx = conn
            .unchecked_transaction()
            .map_err(StorageError::ConnectionFailed)?;
        match f(&tx) {
            Ok(result) => {
                tx.commit().map_err(StorageError::ConnectionFailed)?;
                Ok(result)
            }
            Err(e) => {
                let _ = tx.rollback(); // ignore rollback errors, return original error
                Err(e)
            }
        }
    }

    /// Get current Unix timestamp
    pub fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }
}

/// Default database location under the given data directory.
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("courier.sqlite")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = database_path(dir.path());
        let db = Database::open(&path).unwrap();
        let tables: Vec<String> = db
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .unwrap();
        for expected in ["contacts", "messages", "outbox", "schema_migrations", "users"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = database_path(dir.path());
        drop(Database::open(&path).unwrap());
        // a second open must not re-run the initial migration
        drop(Database::open(&path).unwrap());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO users (username, password_hash, created_at) VALUES ('x', 'h', 0)",
                [],
            )?;
            Err(StorageError::invalid_data("forced rollback"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
