use crate::storage::database::Database;
use crate::storage::errors::{Result, StorageError};
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// The legacy flat-file profile layout (`.dsu`: one JSON object). It is an
/// inert, alternate persistence format; this adapter converts a file into
/// account, contact and history rows exactly once. Nothing ever writes the
/// format back.
#[derive(Debug, Deserialize)]
struct LegacyProfile {
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    dsuserver: Option<String>,
    #[serde(default, rename = "_messages")]
    messages: Vec<LegacyMessage>,
    #[serde(default, rename = "_friends")]
    friends: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    from_user: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
}

/// What a completed import produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub user_id: i64,
    pub username: String,
    pub contacts: u32,
    pub messages: u32,
    pub skipped: u32,
}

impl Database {
    /// One-time import of a legacy profile file. The whole import commits
    /// atomically; on any storage error no partial rows remain.
    pub fn import_legacy_profile(&self, path: &Path) -> Result<ImportSummary> {
        if path.extension().and_then(|e| e.to_str()) != Some("dsu") {
            return Err(StorageError::invalid_data(format!(
                "not a legacy profile file: {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        let profile: LegacyProfile = serde_json::from_str(&raw)?;
        let username = profile
            .username
            .filter(|name| !name.is_empty())
            .ok_or_else(|| StorageError::invalid_data("legacy profile has no username"))?;

        let user = self.get_or_create_user(
            &username,
            profile.password.as_deref().unwrap_or_default(),
            profile.dsuserver.as_deref(),
        )?;

        let mut contacts = 0u32;
        let mut messages = 0u32;
        let mut skipped = 0u32;

        self.with_transaction(|conn| {
            let now = Database::current_timestamp();
            for friend in &profile.friends {
                if friend.trim().is_empty() {
                    continue;
                }
                conn.execute(
                    "INSERT OR IGNORE INTO contacts (user_id, peer, added_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![user.user_id, friend.trim(), now],
                )?;
                contacts += 1;
            }

            for legacy in &profile.messages {
                let Some(body) = legacy.message.as_deref() else {
                    skipped += 1;
                    continue;
                };
                // a message from someone else is inbound; everything else
                // was sent by the profile owner
                let (sender, recipient) = match (&legacy.from_user, &legacy.recipient) {
                    (Some(from), _) if from != &username => (from.clone(), username.clone()),
                    (_, Some(recipient)) => (username.clone(), recipient.clone()),
                    _ => {
                        skipped += 1;
                        continue;
                    }
                };
                conn.execute(
                    r#"
                    INSERT INTO messages (user_id, sender, recipient, body, timestamp, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    rusqlite::params![
                        user.user_id,
                        sender,
                        recipient,
                        body,
                        legacy.timestamp.unwrap_or(0.0),
                        now
                    ],
                )?;
                let peer = if sender == username { &recipient } else { &sender };
                conn.execute(
                    "INSERT OR IGNORE INTO contacts (user_id, peer, added_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![user.user_id, peer, now],
                )?;
                messages += 1;
            }
            Ok(())
        })?;

        if skipped > 0 {
            warn!(skipped, "legacy profile contained unreadable messages");
        }
        Ok(ImportSummary {
            user_id: user.user_id,
            username,
            contacts,
            messages,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_profile(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_import_creates_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_profile(
            dir.path(),
            "alice.dsu",
            r#"{
                "username": "alice",
                "password": "pw",
                "dsuserver": "127.0.0.1",
                "_friends": ["bob", "carol"],
                "_messages": [
                    {"message": "hi", "recipient": "bob", "from_user": "alice", "timestamp": 1.0},
                    {"message": "yo", "from_user": "bob", "timestamp": 2.0},
                    {"recipient": "bob"}
                ]
            }"#,
        );

        let db = Database::open_in_memory().unwrap();
        let summary = db.import_legacy_profile(&path).unwrap();
        assert_eq!(summary.username, "alice");
        assert_eq!(summary.contacts, 2);
        assert_eq!(summary.messages, 2);
        assert_eq!(summary.skipped, 1);

        let history = db.get_messages(summary.user_id, Some("bob"), 50).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "hi");
        assert_eq!(history[1].sender, "bob");
        assert!(db.verify_user("alice", "pw").unwrap());
    }

    #[test]
    fn test_import_rejects_wrong_extension_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();

        let txt = write_profile(dir.path(), "profile.txt", "{}");
        assert!(matches!(
            db.import_legacy_profile(&txt),
            Err(StorageError::InvalidData(_))
        ));

        let broken = write_profile(dir.path(), "broken.dsu", "{not json");
        assert!(matches!(
            db.import_legacy_profile(&broken),
            Err(StorageError::SerializationError(_))
        ));

        let nameless = write_profile(dir.path(), "nameless.dsu", "{}");
        assert!(matches!(
            db.import_legacy_profile(&nameless),
            Err(StorageError::InvalidData(_))
        ));
    }
}
