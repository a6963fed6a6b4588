// src/config/mod.rs

pub mod settings;

pub use settings::{GroupConfigOverride, SettingsManager, SystemSettings};

use crate::error::{AppError, Result};
use secrecy::Secret;
use std::env;

/// Process-level configuration loaded from environment variables.
///
/// Everything that can change at runtime lives in [`SystemSettings`] instead;
/// this struct only holds what must be known before the server starts.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Admin bearer token; also accepted as a global proxy key.
    pub auth_key: String,
    pub encryption_key: Option<Secret<String>>,
    pub database_dsn: String,
    pub redis_dsn: Option<String>,
    /// Slave instances serve proxy traffic but run no background schedulers.
    pub is_slave: bool,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_dsn", &self.database_dsn)
            .field("redis_dsn", &self.redis_dsn)
            .field("is_slave", &self.is_slave)
            .field("encryption_enabled", &self.encryption_key.is_some())
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when `AUTH_KEY` is missing or `PORT` is not a number.
    pub fn from_env() -> Result<Self> {
        let auth_key = env::var("AUTH_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Config {
                message: "AUTH_KEY environment variable is required".to_string(),
            })?;

        let port = match env::var("PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|_| AppError::Config {
                message: format!("PORT must be a number, got '{raw}'"),
            })?,
            Err(_) => 3001,
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            auth_key,
            encryption_key: env::var("ENCRYPTION_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(Secret::new),
            database_dsn: env::var("DATABASE_DSN")
                .unwrap_or_else(|_| "sqlite://data/keypool.db?mode=rwc".to_string()),
            redis_dsn: env::var("REDIS_DSN").ok().filter(|v| !v.trim().is_empty()),
            is_slave: env::var("IS_SLAVE")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
        })
    }
}
