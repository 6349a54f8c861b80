//! Configuration management for the server.

use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// SQLite database file holding the replica
    pub database_path: PathBuf,
    /// Bearer token terminals must present. Open access when unset.
    pub auth_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, one variable at a time.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path = lookup("DATABASE_PATH")
            .unwrap_or_else(|| "kenpos-server.db".to_string())
            .into();

        let auth_secret = match lookup("AUTH_SECRET") {
            Some(secret) if secret.is_empty() => return Err(ConfigError::EmptyAuthSecret),
            other => other,
        };

        Ok(Self {
            host,
            port,
            database_path,
            auth_secret,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("AUTH_SECRET must not be empty when set")]
    EmptyAuthSecret,
}
