use crate::storage::database::Database;
use crate::storage::errors::{Result, StorageError};
use crate::storage::models::{OutboxEntry, OutboxStatus};
use rusqlite::{named_params, Row};

impl Database {
    /// Append a not-yet-confirmed outgoing message. Committed before this
    /// returns: a crash immediately afterwards cannot lose the message.
    pub fn outbox_append(
        &self,
        user_id: i64,
        recipient: &str,
        body: &str,
        timestamp: f64,
    ) -> Result<OutboxEntry> {
        let now = Self::current_timestamp();

        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO outbox (user_id, recipient, body, timestamp, attempts, status, created_at)
                VALUES (:user_id, :recipient, :body, :timestamp, 0, 'pending', :created_at)
                "#,
                named_params! {
                    ":user_id": user_id,
                    ":recipient": recipient,
                    ":body": body,
                    ":timestamp": timestamp,
                    ":created_at": now,
                },
            )?;

            Ok(OutboxEntry {
                outbox_id: conn.last_insert_rowid(),
                user_id,
                recipient: recipient.to_string(),
                body: body.to_string(),
                timestamp,
                attempts: 0,
                status: OutboxStatus::Pending,
                created_at: now,
            })
        })
    }

    /// All pending entries for a user, oldest first. This is the replay
    /// order after a restart.
    pub fn outbox_list_pending(&self, user_id: i64) -> Result<Vec<OutboxEntry>> {
        self.outbox_list_by_status(user_id, OutboxStatus::Pending)
    }

    /// Terminal entries kept for operator inspection and manual retry.
    pub fn outbox_list_failed(&self, user_id: i64) -> Result<Vec<OutboxEntry>> {
        self.outbox_list_by_status(user_id, OutboxStatus::Failed)
    }

    fn outbox_list_by_status(&self, user_id: i64, status: OutboxStatus) -> Result<Vec<OutboxEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT outbox_id, user_id, recipient, body, timestamp, attempts, status, created_at
                FROM outbox
                WHERE user_id = ?1 AND status = ?2
                ORDER BY outbox_id ASC
                "#,
            )?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, status.as_str()],
                outbox_entry_from_row,
            )?;
            let entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Look up a single entry by id.
    pub fn outbox_entry(&self, outbox_id: i64) -> Result<OutboxEntry> {
        self.with_connection(|conn| {
            conn.query_row(
                r#"
                SELECT outbox_id, user_id, recipient, body, timestamp, attempts, status, created_at
                FROM outbox
                WHERE outbox_id = ?1
                "#,
                [outbox_id],
                outbox_entry_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::OutboxEntryNotFound(outbox_id)
                }
                _ => StorageError::ConnectionFailed(e),
            })
        })
    }

    /// Delete an entry after the server acknowledged the send.
    pub fn outbox_mark_sent(&self, outbox_id: i64) -> Result<()> {
        self.with_connection(|conn| {
            let rows = conn.execute("DELETE FROM outbox WHERE outbox_id = ?1", [outbox_id])?;
            if rows == 0 {
                return Err(StorageError::OutboxEntryNotFound(outbox_id));
            }
            Ok(())
        })
    }

    /// Count one failed delivery attempt; returns the new attempt total.
    pub fn outbox_increment_attempt(&self, outbox_id: i64) -> Result<u32> {
        self.with_transaction(|conn| {
            let rows = conn.execute(
                "UPDATE outbox SET attempts = attempts + 1 WHERE outbox_id = ?1",
                [outbox_id],
            )?;
            if rows == 0 {
                return Err(StorageError::OutboxEntryNotFound(outbox_id));
            }
            let attempts: i64 = conn.query_row(
                "SELECT attempts FROM outbox WHERE outbox_id = ?1",
                [outbox_id],
                |row| row.get(0),
            )?;
            Ok(attempts as u32)
        })
    }

    /// Move an entry to the terminal `failed` state. The row stays in the
    /// table for inspection; it only leaves the active retry path.
    pub fn outbox_mark_failed(&self, outbox_id: i64) -> Result<()> {
        self.with_connection(|conn| {
            let rows = conn.execute(
                "UPDATE outbox SET status = 'failed' WHERE outbox_id = ?1",
                [outbox_id],
            )?;
            if rows == 0 {
                return Err(StorageError::OutboxEntryNotFound(outbox_id));
            }
            Ok(())
        })
    }

    /// Manual retry of a failed entry: back to pending with a fresh
    /// attempt budget. Picked up by the replay on the next start.
    pub fn outbox_reset(&self, outbox_id: i64) -> Result<()> {
        self.with_connection(|conn| {
            let rows = conn.execute(
                "UPDATE outbox SET status = 'pending', attempts = 0 WHERE outbox_id = ?1",
                [outbox_id],
            )?;
            if rows == 0 {
                return Err(StorageError::OutboxEntryNotFound(outbox_id));
            }
            Ok(())
        })
    }
}

/// Convert a database row to an OutboxEntry
fn outbox_entry_from_row(row: &Row) -> rusqlite::Result<OutboxEntry> {
    let status: String = row.get("status")?;
    Ok(OutboxEntry {
        outbox_id: row.get("outbox_id")?,
        user_id: row.get("user_id")?,
        recipient: row.get("recipient")?,
        body: row.get("body")?,
        timestamp: row.get("timestamp")?,
        attempts: row.get::<_, i64>("attempts")? as u32,
        status: OutboxStatus::from_str(&status).unwrap_or(OutboxStatus::Pending),
        created_at: row.get("created_at")?,
    })
}
