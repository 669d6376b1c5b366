use crate::storage::database::Database;
use crate::storage::errors::Result;
use crate::storage::models::StoredMessage;
use rusqlite::{named_params, Row};

impl Database {
    /// Record one message (either direction) in the conversation history.
    pub fn add_message(
        &self,
        user_id: i64,
        sender: &str,
        recipient: &str,
        body: &str,
        timestamp: f64,
    ) -> Result<StoredMessage> {
        let now = Self::current_timestamp();

        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO messages (user_id, sender, recipient, body, timestamp, created_at)
                VALUES (:user_id, :sender, :recipient, :body, :timestamp, :created_at)
                "#,
                named_params! {
                    ":user_id": user_id,
                    ":sender": sender,
                    ":recipient": recipient,
                    ":body": body,
                    ":timestamp": timestamp,
                    ":created_at": now,
                },
            )?;

            Ok(StoredMessage {
                message_id: conn.last_insert_rowid(),
                user_id,
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                body: body.to_string(),
                timestamp,
                created_at: now,
            })
        })
    }

    /// Messages for a user, oldest first, optionally restricted to one
    /// conversation partner.
    pub fn get_messages(
        &self,
        user_id: i64,
        peer: Option<&str>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        self.with_connection(|conn| {
            let rows = match peer {
                Some(peer) => {
                    let mut stmt = conn.prepare(
                        r#"
                        SELECT message_id, user_id, sender, recipient, body, timestamp, created_at
                        FROM messages
                        WHERE user_id = ?1 AND (sender = ?2 OR recipient = ?2)
                        ORDER BY timestamp ASC
                        LIMIT ?3
                        "#,
                    )?;
                    let iter = stmt.query_map(
                        rusqlite::params![user_id, peer, limit],
                        message_from_row,
                    )?;
                    iter.collect::<std::result::Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        r#"
                        SELECT message_id, user_id, sender, recipient, body, timestamp, created_at
                        FROM messages
                        WHERE user_id = ?1
                        ORDER BY timestamp ASC
                        LIMIT ?2
                        "#,
                    )?;
                    let iter =
                        stmt.query_map(rusqlite::params![user_id, limit], message_from_row)?;
                    iter.collect::<std::result::Result<Vec<_>, _>>()?
                }
            };
            Ok(rows)
        })
    }

    /// Count history rows for a user.
    pub fn count_messages(&self, user_id: i64) -> Result<u32> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }
}

/// Convert a database row to a StoredMessage
fn message_from_row(row: &Row) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: row.get("message_id")?,
        user_id: row.get("user_id")?,
        sender: row.get("sender")?,
        recipient: row.get("recipient")?,
        body: row.get("body")?,
        timestamp: row.get("timestamp")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_filters_by_peer_in_time_order() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("alice", "pw", None).unwrap();

        db.add_message(user.user_id, "alice", "bob", "to bob", 2.0)
            .unwrap();
        db.add_message(user.user_id, "carol", "alice", "from carol", 1.0)
            .unwrap();
        db.add_message(user.user_id, "bob", "alice", "from bob", 3.0)
            .unwrap();

        let with_bob = db.get_messages(user.user_id, Some("bob"), 50).unwrap();
        let bodies: Vec<&str> = with_bob.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["to bob", "from bob"]);

        let all = db.get_messages(user.user_id, None, 50).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(db.count_messages(user.user_id).unwrap(), 3);
    }

    #[test]
    fn test_history_respects_limit() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("alice", "pw", None).unwrap();
        for i in 0..10 {
            db.add_message(user.user_id, "alice", "bob", "m", i as f64)
                .unwrap();
        }
        assert_eq!(db.get_messages(user.user_id, None, 4).unwrap().len(), 4);
    }
}
