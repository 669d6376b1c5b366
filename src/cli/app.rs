use crate::network::{BackoffPolicy, MessengerOptions};
use crate::storage::{database_path, Database};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration is fatal at startup and never reached at runtime.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("server host must not be empty")]
    EmptyServer,

    #[error("poll interval must be a positive number of seconds")]
    NonPositivePollInterval,

    #[error("retry base delay must be a positive number of milliseconds")]
    ZeroRetryBase,

    #[error("retry delay cap ({cap_secs}s) is below the base delay ({base_ms}ms)")]
    CapBelowBase { cap_secs: u64, base_ms: u64 },
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Message server host
    pub server: String,
    /// Message server port
    pub port: u16,
    /// Seconds between inbound polls
    pub poll_interval_secs: u64,
    /// Delivery attempts per message before it is marked failed
    pub max_retries: u32,
    /// Base reconnect delay in milliseconds
    pub retry_base_ms: u64,
    /// Reconnect delay cap in seconds
    pub retry_cap_secs: u64,
    /// Data directory for the local database
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = Self::default_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            server: "127.0.0.1".to_string(),
            port: 3001,
            poll_interval_secs: 2,
            max_retries: 5,
            retry_base_ms: 1000,
            retry_cap_secs: 60,
            data_dir,
        }
    }
}

impl Config {
    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "courier", "courier")
            .map(|proj_dirs| proj_dirs.data_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
    }

    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "courier", "courier")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load_or_create_default() -> Result<Self> {
        let config_file = Self::default_config_file()?;

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .context("Failed to read configuration file")?;
            let config: Config =
                toml::from_str(&content).context("Failed to parse configuration file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::default_config_file()?;

        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(&config_file, content).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Reject configurations the messaging subsystem cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::NonPositivePollInterval);
        }
        if self.retry_base_ms == 0 {
            return Err(ConfigError::ZeroRetryBase);
        }
        if self.retry_cap_secs * 1000 < self.retry_base_ms {
            return Err(ConfigError::CapBelowBase {
                cap_secs: self.retry_cap_secs,
                base_ms: self.retry_base_ms,
            });
        }
        Ok(())
    }

    /// `host:port` of the message server.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Get the database path
    pub fn database_path(&self) -> PathBuf {
        database_path(&self.data_dir)
    }

    /// The messaging subsystem's options for this configuration.
    pub fn messenger_options(&self, username: &str, password: &str) -> MessengerOptions {
        let mut options = MessengerOptions::new(self.server_addr(), username, password);
        options.poll_interval = Duration::from_secs(self.poll_interval_secs);
        options.max_retries = self.max_retries;
        options.backoff = BackoffPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_secs(self.retry_cap_secs),
        );
        options
    }
}

/// Main application state
pub struct App {
    /// Application configuration
    pub config: Config,
    /// Database connection
    pub database: Arc<Database>,
}

impl App {
    /// Create a new App instance with proper initialization
    pub fn new() -> Result<Self> {
        let config =
            Config::load_or_create_default().context("Failed to initialize configuration")?;
        config.validate().context("Invalid configuration")?;

        Self::ensure_data_dir(&config.data_dir).context("Failed to create data directory")?;
        let database = Arc::new(
            Database::open(&config.database_path()).context("Failed to initialize database")?,
        );

        Ok(App { config, database })
    }

    /// Ensure data directory exists with proper permissions
    pub fn ensure_data_dir(data_dir: &PathBuf) -> Result<()> {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }
        Ok(())
    }
}
