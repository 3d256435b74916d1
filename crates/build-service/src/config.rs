//! Configuration management for the build service.
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use wrtforge_common::RequestLimits;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub server_host: String,

    /// API server port
    pub server_port: u16,

    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Root directory for per-fingerprint artifact directories
    pub store_path: PathBuf,

    /// Container runtime binary, `podman` or `docker`
    pub container_runtime: String,

    /// Container runtime socket; empty uses the runtime's default
    pub container_socket_path: String,

    /// ImageBuilder image tag prefix, e.g. `ghcr.io/openwrt/imagebuilder`
    pub imagebuilder_registry: String,

    /// Admission cap: maximum number of pending jobs
    pub max_pending_jobs: usize,

    /// Per-build deadline in seconds
    pub job_timeout_seconds: u64,

    /// How long successful results are served from cache
    pub build_ttl_seconds: u64,

    /// How long failed results are served from cache
    pub failure_ttl_seconds: u64,

    /// Whether first-boot `defaults` scripts are honored
    pub allow_defaults: bool,

    /// Worker identifier stamped onto claimed jobs
    pub worker_id: String,

    /// Number of concurrent build workers
    pub worker_concurrent: usize,

    /// Dispatcher tick in seconds
    pub worker_poll_seconds: u64,

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
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid SERVER_PORT")?,

            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/builder.db".to_string())
                .into(),

            store_path: env::var("STORE_PATH")
                .unwrap_or_else(|_| "./public/store".to_string())
                .into(),

            container_runtime: env::var("CONTAINER_RUNTIME")
                .unwrap_or_else(|_| "podman".to_string()),

            container_socket_path: env::var("CONTAINER_SOCKET_PATH")
                .unwrap_or_else(|_| "/run/podman/podman.sock".to_string()),

            imagebuilder_registry: env::var("IMAGEBUILDER_REGISTRY")
                .unwrap_or_else(|_| "ghcr.io/openwrt/imagebuilder".to_string()),

            max_pending_jobs: env::var("MAX_PENDING_JOBS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .context("Invalid MAX_PENDING_JOBS")?,

            job_timeout_seconds: env::var("JOB_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .context("Invalid JOB_TIMEOUT_SECONDS")?,

            build_ttl_seconds: env::var("BUILD_TTL_SECONDS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .context("Invalid BUILD_TTL_SECONDS")?,

            failure_ttl_seconds: env::var("FAILURE_TTL_SECONDS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("Invalid FAILURE_TTL_SECONDS")?,

            allow_defaults: env::var("ALLOW_DEFAULTS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid ALLOW_DEFAULTS (expected true/false)")?,

            worker_id: env::var("WORKER_ID")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4())),

            worker_concurrent: env::var("WORKER_CONCURRENT")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid WORKER_CONCURRENT")?,

            worker_poll_seconds: env::var("WORKER_POLL_SECONDS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid WORKER_POLL_SECONDS")?,

            max_defaults_length: env::var("MAX_DEFAULTS_LENGTH")
                .unwrap_or_else(|_| "20480".to_string())
                .parse()
                .context("Invalid MAX_DEFAULTS_LENGTH")?,

            max_custom_rootfs_size_mb: env::var("MAX_CUSTOM_ROOTFS_SIZE_MB")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .context("Invalid MAX_CUSTOM_ROOTFS_SIZE_MB")?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            anyhow::bail!("SERVER_PORT must be greater than 0");
        }

        if self.container_runtime != "podman" && self.container_runtime != "docker" {
            anyhow::bail!("CONTAINER_RUNTIME must be 'podman' or 'docker'");
        }

        if self.max_pending_jobs == 0 {
            anyhow::bail!("MAX_PENDING_JOBS must be at least 1");
        }

        if self.worker_concurrent == 0 {
            anyhow::bail!("WORKER_CONCURRENT must be at least 1");
        }

        if self.job_timeout_seconds == 0 {
            anyhow::bail!("JOB_TIMEOUT_SECONDS must be greater than 0");
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

    /// Per-build deadline
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    /// Dispatcher tick interval
    pub fn worker_poll(&self) -> Duration {
        Duration::from_secs(self.worker_poll_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            database_path: "./data/builder.db".into(),
            store_path: "./public/store".into(),
            container_runtime: "podman".to_string(),
            container_socket_path: String::new(),
            imagebuilder_registry: "ghcr.io/openwrt/imagebuilder".to_string(),
            max_pending_jobs: 200,
            job_timeout_seconds: 600,
            build_ttl_seconds: 86400,
            failure_ttl_seconds: 3600,
            allow_defaults: true,
            worker_id: "test-worker".to_string(),
            worker_concurrent: 4,
            worker_poll_seconds: 5,
            max_defaults_length: 20480,
            max_custom_rootfs_size_mb: 1024,
        }
    }

    #[test]
    fn test_api_address() {
        let config = base_config();
        assert_eq!(config.api_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_validate_rejects_unknown_runtime() {
        let mut config = base_config();
        config.container_runtime = "lxc".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("CONTAINER_RUNTIME"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = base_config();
        config.worker_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limits_follow_config() {
        let mut config = base_config();
        config.allow_defaults = false;
        config.max_defaults_length = 1024;

        let limits = config.limits();
        assert!(!limits.allow_defaults);
        assert_eq!(limits.max_defaults_length, 1024);
    }
}
