//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub federation: FederationConfig,
    pub queues: QueuesConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
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

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub description: String,
    /// Username of the instance actor that signs fetches (default: "actor")
    #[serde(default = "default_actor_username")]
    pub actor_username: String,
}

fn default_actor_username() -> String {
    "actor".to_string()
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Accepted age of `x-signed-at`, in either direction (default: 300)
    pub signature_max_age_secs: u64,
    /// Remote actors older than this are refreshed (default: 86400)
    pub actor_ttl_secs: u64,
    /// How long failed lookups short-circuit to "unresolved" (default: 300)
    pub lookup_cooldown_secs: u64,
    /// Allow fetching loopback/private hosts (tests and closed networks only)
    #[serde(default)]
    pub allow_private_addresses: bool,
    /// Outbound HTTP timeout (default: 30)
    pub request_timeout_secs: u64,
    /// Largest accepted inbox body (default: 1 MiB)
    pub max_body_bytes: usize,
    /// How often the staleness sweep runs (default: 3600)
    pub refresh_interval_secs: u64,
}

impl FederationConfig {
    pub fn signature_max_age(&self) -> Duration {
        Duration::from_secs(self.signature_max_age_secs)
    }

    pub fn actor_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_ttl_secs)
    }

    pub fn lookup_cooldown(&self) -> Duration {
        Duration::from_secs(self.lookup_cooldown_secs)
    }
}

/// Per-queue worker settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    pub inbox: QueueConfig,
    pub delivery: QueueConfig,
    pub fetch: QueueConfig,
}

/// Worker pool and retry policy for one queue
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    pub base_backoff_ms: u64,
    /// Upper bound for the retry delay in milliseconds
    pub max_backoff_ms: u64,
    /// Lock duration of a claimed job; expired locks are re-claimable
    pub visibility_timeout_secs: u64,
    /// Idle poll interval in milliseconds
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 8,
            base_backoff_ms: 5_000,
            max_backoff_ms: 3_600_000,
            visibility_timeout_secs: 300,
            poll_interval_ms: 2_000,
        }
    }
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
    /// 4. Environment variables (MERIDIAN__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("instance.actor_username", "actor")?
            .set_default("federation.signature_max_age_secs", 300)?
            .set_default("federation.actor_ttl_secs", 86400)?
            .set_default("federation.lookup_cooldown_secs", 300)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.request_timeout_secs", 30)?
            .set_default("federation.max_body_bytes", 1_048_576)?
            .set_default("federation.refresh_interval_secs", 3600)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?;

        let queue_defaults = QueueConfig::default();
        for queue in ["inbox", "delivery", "fetch"] {
            builder = builder
                .set_default(
                    format!("queues.{queue}.concurrency"),
                    queue_defaults.concurrency as i64,
                )?
                .set_default(
                    format!("queues.{queue}.max_attempts"),
                    queue_defaults.max_attempts as i64,
                )?
                .set_default(
                    format!("queues.{queue}.base_backoff_ms"),
                    queue_defaults.base_backoff_ms as i64,
                )?
                .set_default(
                    format!("queues.{queue}.max_backoff_ms"),
                    queue_defaults.max_backoff_ms as i64,
                )?
                .set_default(
                    format!("queues.{queue}.visibility_timeout_secs"),
                    queue_defaults.visibility_timeout_secs as i64,
                )?
                .set_default(
                    format!("queues.{queue}.poll_interval_ms"),
                    queue_defaults.poll_interval_ms as i64,
                )?;
        }

        let config = builder
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("MERIDIAN")
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

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.federation.signature_max_age_secs == 0 {
            return Err(AppError::Config(
                "federation.signature_max_age_secs must be greater than 0".to_string(),
            ));
        }

        for (name, queue) in [
            ("inbox", &self.queues.inbox),
            ("delivery", &self.queues.delivery),
            ("fetch", &self.queues.fetch),
        ] {
            if queue.concurrency == 0 {
                return Err(AppError::Config(format!(
                    "queues.{name}.concurrency must be greater than 0"
                )));
            }
            if queue.max_attempts == 0 {
                return Err(AppError::Config(format!(
                    "queues.{name}.max_attempts must be greater than 0"
                )));
            }
            if queue.base_backoff_ms > queue.max_backoff_ms {
                return Err(AppError::Config(format!(
                    "queues.{name}.base_backoff_ms must not exceed max_backoff_ms"
                )));
            }
        }

        if !self.server.protocol.eq_ignore_ascii_case("https") {
            if is_local_server_domain(&self.server.domain) {
                tracing::warn!(
                    domain = %self.server.domain,
                    "Serving federation over plain http for local development"
                );
            } else {
                return Err(AppError::Config(
                    "server.protocol must be https for non-local server domains".to_string(),
                ));
            }
        }

        if self.federation.allow_private_addresses {
            tracing::warn!("federation.allow_private_addresses is enabled; SSRF guard disabled");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/meridian-test.db"),
            },
            instance: InstanceConfig {
                title: "Meridian".to_string(),
                description: "Test instance".to_string(),
                actor_username: "actor".to_string(),
            },
            federation: FederationConfig {
                signature_max_age_secs: 300,
                actor_ttl_secs: 86_400,
                lookup_cooldown_secs: 300,
                allow_private_addresses: false,
                request_timeout_secs: 5,
                max_body_bytes: 1_048_576,
                refresh_interval_secs: 3600,
            },
            queues: QueuesConfig {
                inbox: QueueConfig::default(),
                delivery: QueueConfig::default(),
                fetch: QueueConfig::default(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = valid_config();
        config.queues.delivery.concurrency = 0;

        let error = config.validate().expect_err("zero workers must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("queues.delivery.concurrency")
        ));
    }

    #[test]
    fn validate_rejects_inverted_backoff_bounds() {
        let mut config = valid_config();
        config.queues.inbox.base_backoff_ms = 10_000;
        config.queues.inbox.max_backoff_ms = 1_000;

        assert!(config.validate().is_err());
    }
}
