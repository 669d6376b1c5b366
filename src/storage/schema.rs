use crate::storage::errors::{Result, StorageError};
use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Migration represents a single database migration
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All database migrations in order
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema with users, contacts, messages and outbox tables",
    sql: r#"
            -- Local accounts
            CREATE TABLE users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                server TEXT,
                created_at INTEGER NOT NULL
            );

            -- Known peers, auto-recorded from message traffic
            CREATE TABLE contacts (
                contact_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                peer TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE,
                UNIQUE(user_id, peer)
            );

            -- Conversation history, both directions
            CREATE TABLE messages (
                message_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp REAL NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
            );

            -- Durable queue of not-yet-confirmed outgoing messages.
            -- Entries are deleted on server ack; exhausted entries are kept
            -- with status 'failed' for manual inspection and retry.
            CREATE TABLE outbox (
                outbox_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                recipient TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp REAL NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'failed')),
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
            );

            -- Schema migrations tracking table
            CREATE TABLE schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL,
                description TEXT NOT NULL
            );

            -- Indexes for performance
            CREATE INDEX idx_contacts_user ON contacts(user_id, peer);
            CREATE INDEX idx_messages_user_time ON messages(user_id, timestamp);
            CREATE INDEX idx_messages_peer ON messages(user_id, sender, recipient);
            CREATE INDEX idx_outbox_user_status ON outbox(user_id, status, outbox_id);
        "#,
}];

/// Initialize the database schema and run any pending migrations
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(|e| {
            StorageError::migration_failed(0, format!("Failed to enable foreign keys: {}", e))
        })?;

    // Check if schema_migrations table exists
    let migrations_exist = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='schema_migrations'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !migrations_exist {
        // First time setup - run all migrations
        run_all_migrations(conn)?;
    } else {
        // Run any pending migrations
        run_pending_migrations(conn)?;
    }

    Ok(())
}

/// Run all migrations from scratch
fn run_all_migrations(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction().map_err(|e| {
        StorageError::migration_failed(-1, format!("Failed to start transaction: {}", e))
    })?;

    for migration in MIGRATIONS {
        execute_migration(&tx, migration)?;
    }

    tx.commit().map_err(|e| {
        StorageError::migration_failed(-1, format!("Failed to commit migrations: {}", e))
    })?;

    Ok(())
}

/// Run any pending migrations
fn run_pending_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_current_version(conn)?;

    let pending_migrations: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending_migrations.is_empty() {
        return Ok(());
    }

    let tx = conn.unchecked_transaction().map_err(|e| {
        StorageError::migration_failed(-1, format!("Failed to start transaction: {}", e))
    })?;

    for migration in pending_migrations {
        execute_migration(&tx, migration)?;
    }

    tx.commit().map_err(|e| {
        StorageError::migration_failed(-1, format!("Failed to commit migrations: {}", e))
    })?;

    Ok(())
}

/// Execute a single migration
fn execute_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute_batch(migration.sql).map_err(|e| {
        StorageError::migration_failed(
            migration.version,
            format!("Failed to execute migration {}: {}", migration.version, e),
        )
    })?;

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?1, ?2, ?3)",
        (
            migration.version,
            current_timestamp(),
            migration.description,
        ),
    )
    .map_err(|e| {
        StorageError::migration_failed(
            migration.version,
            format!("Failed to record migration {}: {}", migration.version, e),
        )
    })?;

    Ok(())
}

/// Get the current schema version
fn get_current_version(conn: &Connection) -> Result<i32> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .map_err(|e| {
            StorageError::migration_failed(-1, format!("Failed to get current version: {}", e))
        })?
        .unwrap_or(0);

    Ok(version)
}

/// Get current Unix timestamp
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}
