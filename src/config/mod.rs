//! Configuration management for praxisdb
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with PRAXISDB__)
//! - Configuration files (config.toml)
//! - Default values

use crate::errors::{DalError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of pooled connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create the database file if it does not exist
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
}

fn default_url() -> String {
    "sqlite://praxis.db".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_create_if_missing() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            create_if_missing: default_create_if_missing(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// Precedence (lowest to highest): defaults, `config.toml`,
    /// `PRAXISDB__*` environment variables (e.g. `PRAXISDB__DATABASE__URL`).
    pub fn load() -> Result<Self> {
        // Load .env if present; ignore absence
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("PRAXISDB").separator("__"))
            .build()
            .map_err(|e| DalError::Configuration {
                message: e.to_string(),
            })?;

        // Fall back to defaults for anything not provided
        let mut app: AppConfig = AppConfig::default();
        if let Ok(db) = config.get::<DatabaseConfig>("database") {
            app.database = db;
        }

        Ok(app)
    }
}

impl DatabaseConfig {
    /// Connection acquire timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle connection timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
