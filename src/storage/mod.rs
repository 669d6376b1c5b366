pub mod contacts;
pub mod database;
pub mod errors;
pub mod history;
pub mod import;
pub mod models;
pub mod outbox;
pub mod schema;
pub mod users;

pub use database::{database_path, Database};
pub use errors::{Result, StorageError};
pub use import::ImportSummary;
pub use models::{Contact, OutboxEntry, OutboxStatus, StoredMessage, User};
