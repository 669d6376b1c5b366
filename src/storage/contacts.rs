use crate::storage::database::Database;
use crate::storage::errors::Result;
use crate::storage::models::Contact;
use rusqlite::Row;

impl Database {
    /// Record a peer identity. Idempotent; message traffic calls this for
    /// every delivery and receipt.
    pub fn contact_add(&self, user_id: i64, peer: &str) -> Result<()> {
        let now = Self::current_timestamp();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO contacts (user_id, peer, added_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, peer, now],
            )?;
            Ok(())
        })
    }

    /// All known peers for a user, sorted by name.
    pub fn contact_list(&self, user_id: i64) -> Result<Vec<Contact>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT contact_id, user_id, peer, added_at
                FROM contacts
                WHERE user_id = ?1
                ORDER BY peer ASC
                "#,
            )?;
            let iter = stmt.query_map([user_id], contact_from_row)?;
            let contacts = iter.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(contacts)
        })
    }

    pub fn contact_remove(&self, user_id: i64, peer: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM contacts WHERE user_id = ?1 AND peer = ?2",
                rusqlite::params![user_id, peer],
            )?;
            Ok(())
        })
    }
}

fn contact_from_row(row: &Row) -> rusqlite::Result<Contact> {
    Ok(Contact {
        contact_id: row.get("contact_id")?,
        user_id: row.get("user_id")?,
        peer: row.get("peer")?,
        added_at: row.get("added_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_add_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("alice", "pw", None).unwrap();
        db.contact_add(user.user_id, "bob").unwrap();
        db.contact_add(user.user_id, "bob").unwrap();
        db.contact_add(user.user_id, "amy").unwrap();

        let contacts = db.contact_list(user.user_id).unwrap();
        let peers: Vec<&str> = contacts.iter().map(|c| c.peer.as_str()).collect();
        assert_eq!(peers, vec!["amy", "bob"]);

        db.contact_remove(user.user_id, "bob").unwrap();
        assert_eq!(db.contact_list(user.user_id).unwrap().len(), 1);
    }
}
