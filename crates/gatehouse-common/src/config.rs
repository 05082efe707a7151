//! Configuration model for Gatehouse services
//!
//! Every section is deserialized from `GATEHOUSE_*` environment variables, with
//! `__` separating the section from the key:
//!
//! ```text
//! GATEHOUSE_LISTENER__PORT=4443
//! GATEHOUSE_DATABASE__HOST=db.internal
//! GATEHOUSE_DATABASE__TARGET_CONNECTIONS=6
//! ```

use crate::error::{GatehouseError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment prefix for all settings
pub const ENV_PREFIX: &str = "GATEHOUSE";

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatehouseConfig {
    pub listener: ListenerSettings,
    pub database: DatabaseSettings,
    pub tls: TlsSettings,
    pub telemetry: TelemetrySettings,
}

impl GatehouseConfig {
    /// Load from the environment
    ///
    /// Not validated here; callers validate once every override is applied.
    pub fn load() -> Result<Self> {
        load_from_env(ENV_PREFIX)
    }

    pub fn validate(&self) -> Result<()> {
        self.listener.validate()?;
        self.database.validate()
    }
}

/// Client-facing listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Address to bind
    pub bind_address: String,
    /// TLS port
    pub port: u16,
    /// Admission ceiling (simultaneous sessions)
    pub max_connections: usize,
    /// Attempts per address allowed inside one flood window (0 disables the guard)
    pub flood_threshold: u32,
    /// Length of the flood window in milliseconds
    pub flood_window_ms: u64,
    /// Bound on every line read from a client
    pub read_timeout_ms: u64,
    /// Longest command line accepted
    pub max_line_bytes: usize,
    /// Grant root to loopback peers without a challenge
    pub loopback_is_root: bool,
    /// TCP keepalive time in seconds
    pub tcp_keepalive_secs: u64,
    /// Port for /health and /metrics (0 disables)
    pub metrics_port: u16,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 4443,
            max_connections: 100,
            flood_threshold: 30,
            flood_window_ms: 60_000,
            read_timeout_ms: 30_000,
            max_line_bytes: 64 * 1024,
            loopback_is_root: true,
            tcp_keepalive_secs: 30,
            metrics_port: 9090,
        }
    }
}

impl ListenerSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn flood_window(&self) -> Duration {
        Duration::from_millis(self.flood_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(GatehouseError::ConfigError(
                "listener.max_connections must be at least 1".into(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(GatehouseError::ConfigError(
                "listener.read_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Backing database and pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Schema to connect to
    pub name: String,
    /// Idle connections at or below which the filler is woken
    pub min_connections: usize,
    /// Idle connections the filler aims for
    pub target_connections: usize,
    /// Hard cap on idle connections
    pub max_connections: usize,
    /// Connect, query and wait timeout in milliseconds
    pub timeout_ms: u64,
    /// Stop the whole subsystem on the first execution or connect failure
    pub fail_fast: bool,
    /// Restart a serializer after a worker-level fatal error instead of stopping
    pub restart_on_fatal: bool,
    /// Boolean SQL function taking (username, password)
    pub auth_function: String,
    /// Optional procedure definitions file
    pub procedures_file: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 3306,
            username: "gatehouse".into(),
            password: String::new(),
            name: "gatehouse".into(),
            min_connections: 2,
            target_connections: 4,
            max_connections: 8,
            timeout_ms: 10_000,
            fail_fast: false,
            restart_on_fatal: true,
            auth_function: "verify_password".into(),
            procedures_file: None,
        }
    }
}

impl DatabaseSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pool bounds must satisfy `min <= target <= max` with a non-zero max
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(GatehouseError::ConfigError(
                "database.max_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.target_connections
            || self.target_connections > self.max_connections
        {
            return Err(GatehouseError::ConfigError(format!(
                "pool bounds must satisfy min <= target <= max (got {} / {} / {})",
                self.min_connections, self.target_connections, self.max_connections
            )));
        }
        if self.timeout_ms == 0 {
            return Err(GatehouseError::ConfigError(
                "database.timeout_ms must be positive".into(),
            ));
        }
        if self.auth_function.is_empty()
            || !self
                .auth_function
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(GatehouseError::ConfigError(format!(
                "database.auth_function '{}' is not a plain identifier",
                self.auth_function
            )));
        }
        Ok(())
    }
}

/// TLS configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Path to certificate file
    pub cert_path: Option<String>,
    /// Path to private key file
    pub key_path: Option<String>,
    /// Generate self-signed certificate if not provided
    pub self_signed: bool,
    /// Common name for the generated certificate
    pub common_name: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            self_signed: true,
            common_name: "gatehouse.local".into(),
        }
    }
}

/// Telemetry/observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable JSON log format
    pub json_logs: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

/// Load configuration from environment variables
pub fn load_from_env<T: for<'de> Deserialize<'de>>(prefix: &str) -> Result<T> {
    let built = config::Config::builder()
        .add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(built.try_deserialize()?)
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
