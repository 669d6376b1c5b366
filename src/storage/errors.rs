use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database connection failed: {0}")]
    ConnectionFailed(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("outbox entry not found: {0}")]
    OutboxEntryNotFound(i64),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("database path error: {0}")]
    DatabasePathError(String),
}

impl StorageError {
    pub fn migration_failed(version: i32, message: impl Into<String>) -> Self {
        StorageError::MigrationFailed(format!("version {}: {}", version, message.into()))
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        StorageError::InvalidData(message.into())
    }

    pub fn database_path_error(message: impl Into<String>) -> Self {
        StorageError::DatabasePathError(message.into())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
