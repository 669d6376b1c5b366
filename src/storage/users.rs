use crate::auth;
use crate::storage::database::Database;
use crate::storage::errors::{Result, StorageError};
use crate::storage::models::User;
use rusqlite::{named_params, OptionalExtension, Row};

impl Database {
    /// Fetch the account row for `username`, or create it with a freshly
    /// hashed secret. Existing rows are kept in sync with the supplied
    /// secret: a legacy plain-text row is upgraded to a hash, and a secret
    /// that no longer verifies replaces the stored hash (the server is the
    /// authority on credentials; the local row is only a cache).
    pub fn get_or_create_user(
        &self,
        username: &str,
        password: &str,
        server: Option<&str>,
    ) -> Result<User> {
        if let Some(user) = self.find_user(username)? {
            let needs_rehash = user.password_hash == password
                || !auth::verify_password(password, &user.password_hash);
            if needs_rehash {
                return self.update_user_password(username, password);
            }
            return Ok(user);
        }

        let now = Self::current_timestamp();
        let password_hash = auth::hash_password(password);
        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO users (username, password_hash, server, created_at)
                VALUES (:username, :password_hash, :server, :created_at)
                "#,
                named_params! {
                    ":username": username,
                    ":password_hash": password_hash,
                    ":server": server,
                    ":created_at": now,
                },
            )?;
            Ok(User {
                user_id: conn.last_insert_rowid(),
                username: username.to_string(),
                password_hash,
                server: server.map(str::to_string),
                created_at: now,
            })
        })
    }

    pub fn find_user(&self, username: &str) -> Result<Option<User>> {
        self.with_connection(|conn| {
            let user = conn
                .query_row(
                    r#"
                    SELECT user_id, username, password_hash, server, created_at
                    FROM users
                    WHERE username = ?1
                    "#,
                    [username],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
    }

    pub fn get_user(&self, username: &str) -> Result<User> {
        self.find_user(username)?
            .ok_or_else(|| StorageError::UserNotFound(username.to_string()))
    }

    /// The credential-verification capability: check a secret against the
    /// stored hash.
    pub fn verify_user(&self, username: &str, password: &str) -> Result<bool> {
        let user = self.get_user(username)?;
        Ok(auth::verify_password(password, &user.password_hash))
    }

    /// The credential-storage capability: hash and store a new secret.
    pub fn update_user_password(&self, username: &str, password: &str) -> Result<User> {
        let password_hash = auth::hash_password(password);
        self.with_connection(|conn| {
            let rows = conn.execute(
                "UPDATE users SET password_hash = ?1 WHERE username = ?2",
                rusqlite::params![password_hash, username],
            )?;
            if rows == 0 {
                return Err(StorageError::UserNotFound(username.to_string()));
            }
            Ok(())
        })?;
        self.get_user(username)
    }
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get("user_id")?,
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        server: row.get("server")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_fetch_user() {
        let db = Database::open_in_memory().unwrap();
        let created = db
            .get_or_create_user("alice", "hunter2", Some("127.0.0.1:3001"))
            .unwrap();
        assert_ne!(created.password_hash, "hunter2");

        let fetched = db.get_or_create_user("alice", "hunter2", None).unwrap();
        assert_eq!(fetched.user_id, created.user_id);
        assert!(db.verify_user("alice", "hunter2").unwrap());
        assert!(!db.verify_user("alice", "wrong").unwrap());
    }

    #[test]
    fn test_legacy_plain_text_row_is_upgraded() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO users (username, password_hash, created_at) VALUES ('old', 'secret', 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let user = db.get_or_create_user("old", "secret", None).unwrap();
        assert!(user.password_hash.starts_with("pbkdf2:"));
        assert!(db.verify_user("old", "secret").unwrap());
    }

    #[test]
    fn test_changed_secret_refreshes_stored_hash() {
        let db = Database::open_in_memory().unwrap();
        db.get_or_create_user("alice", "first", None).unwrap();
        db.get_or_create_user("alice", "second", None).unwrap();
        assert!(db.verify_user("alice", "second").unwrap());
        assert!(!db.verify_user("alice", "first").unwrap());
    }

    #[test]
    fn test_unknown_user_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_user("ghost"),
            Err(StorageError::UserNotFound(_))
        ));
    }
}
