//! Configuration management for the prepare service.
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;

use wrtforge_common::RequestLimits;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub server_host: String,

    /// API server port
    pub server_port: u16,

    /// Whether first-boot `defaults` scripts pass validation
    pub allow_defaults: bool,

    /// Maximum `defaults` script length in bytes
    pub max_defaults_length: usize,

    /// Maximum custom rootfs size in megabytes
    pub max_custom_rootfs_size_mb: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8001".to_string())
                .parse()
                .context("Invalid SERVER_PORT")?,

            allow_defaults: env::var("ALLOW_DEFAULTS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid ALLOW_DEFAULTS (expected true/false)")?,

            max_defaults_length: env::var("MAX_DEFAULTS_LENGTH")
                .unwrap_or_else(|_| "20480".to_string())
                .parse()
                .context("Invalid MAX_DEFAULTS_LENGTH")?,

            max_custom_rootfs_size_mb: env::var("MAX_CUSTOM_ROOTFS_SIZE_MB")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .context("Invalid MAX_CUSTOM_ROOTFS_SIZE_MB")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            anyhow::bail!("SERVER_PORT must be greater than 0");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Validation caps handed to request canonicalization
    pub fn limits(&self) -> RequestLimits {
        RequestLimits {
            max_defaults_length: self.max_defaults_length,
            max_rootfs_size_mb: self.max_custom_rootfs_size_mb,
            allow_defaults: self.allow_defaults,
        }
    }
}
