//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub actor: ActorConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "tracker.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://tracker.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Lifetime of the instance signing key in seconds (default: 30 days)
    pub key_lifetime_seconds: u64,
    /// Remote public key cache TTL in seconds (default: 1 hour)
    pub key_cache_ttl_seconds: u64,
    /// Outbound HTTP timeout in seconds (default: 30)
    pub delivery_timeout_seconds: u64,
    /// Maximum concurrent remote deliveries (default: 10)
    pub max_concurrent_deliveries: usize,
}

/// Local actor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Preferred username (default: "admin")
    #[serde(default = "default_actor_username")]
    pub username: String,
    /// Display name (default: "Admin")
    #[serde(default = "default_actor_display_name")]
    pub display_name: String,
    /// Profile summary
    pub summary: Option<String>,
}

fn default_actor_username() -> String {
    "admin".to_string()
}

fn default_actor_display_name() -> String {
    "Admin".to_string()
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token guarding the policy administration endpoints (32+ bytes)
    pub token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (DRIFTWOOD_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.key_lifetime_seconds", 2_592_000)?
            .set_default("federation.key_cache_ttl_seconds", 3600)?
            .set_default("federation.delivery_timeout_seconds", 30)?
            .set_default("federation.max_concurrent_deliveries", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (DRIFTWOOD_*)
            .add_source(
                Environment::with_prefix("DRIFTWOOD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_ADMIN_TOKEN_BYTES: usize = 32;

        if self.admin.token.as_bytes().len() < MIN_ADMIN_TOKEN_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "admin.token must be at least {} bytes",
                MIN_ADMIN_TOKEN_BYTES
            )));
        }

        if self.federation.key_lifetime_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.key_lifetime_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_concurrent_deliveries == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_concurrent_deliveries must be greater than 0".to_string(),
            ));
        }

        match self.server.protocol.as_str() {
            "http" | "https" => Ok(()),
            other => Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                other
            ))),
        }
    }
}
