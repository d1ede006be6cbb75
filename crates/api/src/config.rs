//! Application configuration

use std::env;
use std::time::Duration;

use time::UtcOffset;

use crate::realtime::{BridgeSettings, ConnectionSettings, OverflowPolicy};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis bridge (disabled when REDIS_URL is unset)
    pub redis_url: Option<String>,
    pub bridge_channel_prefix: String,
    pub bridge_publish_timeout: Duration,
    pub bridge_reconnect_max_delay: Duration,

    // Authentication
    pub jwt_secret: String,
    pub internal_api_token: String,

    // Realtime connections
    pub ws_outbound_capacity: usize,
    pub ws_overflow_policy: OverflowPolicy,
    pub ws_ping_interval: Duration,
    pub ws_idle_timeout: Duration,

    // Dispatch
    pub quiet_hours_offset: UtcOffset,
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let ws_ping_interval = Duration::from_secs(parse_var("WS_PING_INTERVAL_SECS", 30)?);
        let ws_idle_timeout = Duration::from_secs(parse_var("WS_IDLE_TIMEOUT_SECS", 90)?);
        if ws_idle_timeout <= ws_ping_interval {
            return Err(ConfigError::Invalid(
                "WS_IDLE_TIMEOUT_SECS",
                "must be greater than WS_PING_INTERVAL_SECS".to_string(),
            ));
        }

        let ws_outbound_capacity: usize = parse_var("WS_OUTBOUND_CAPACITY", 256)?;
        if ws_outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "WS_OUTBOUND_CAPACITY",
                "must be at least 1".to_string(),
            ));
        }

        let offset_minutes: i32 = parse_var("QUIET_HOURS_UTC_OFFSET_MINUTES", 0)?;
        let quiet_hours_offset = UtcOffset::from_whole_seconds(offset_minutes.saturating_mul(60)).map_err(|e| {
            ConfigError::Invalid("QUIET_HOURS_UTC_OFFSET_MINUTES", e.to_string())
        })?;

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            shutdown_grace: Duration::from_secs(parse_var("SHUTDOWN_GRACE_SECS", 5)?),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                Ok("pretty") | Err(_) => LogFormat::Pretty,
                Ok(other) => {
                    return Err(ConfigError::Invalid(
                        "LOG_FORMAT",
                        format!("expected json or pretty, got {}", other),
                    ))
                }
            },

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,

            // Redis bridge
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            bridge_channel_prefix: env::var("BRIDGE_CHANNEL_PREFIX").unwrap_or_default(),
            bridge_publish_timeout: Duration::from_millis(parse_var(
                "BRIDGE_PUBLISH_TIMEOUT_MS",
                500,
            )?),
            bridge_reconnect_max_delay: Duration::from_millis(parse_var(
                "BRIDGE_RECONNECT_MAX_DELAY_MS",
                30_000,
            )?),

            // Authentication
            jwt_secret: required_secret("JWT_SECRET")?,
            internal_api_token: required_secret("INTERNAL_API_TOKEN")?,

            // Realtime connections
            ws_outbound_capacity,
            ws_overflow_policy: match env::var("WS_OVERFLOW_POLICY") {
                Ok(value) => value
                    .parse()
                    .map_err(|e| ConfigError::Invalid("WS_OVERFLOW_POLICY", e))?,
                Err(_) => OverflowPolicy::default(),
            },
            ws_ping_interval,
            ws_idle_timeout,

            // Dispatch
            quiet_hours_offset,
        })
    }

    /// Per-connection tunables handed to every upgraded socket
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_capacity: self.ws_outbound_capacity,
            overflow_policy: self.ws_overflow_policy,
            ping_interval: self.ws_ping_interval,
            idle_timeout: self.ws_idle_timeout,
            drain_grace: self.shutdown_grace,
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            channel_prefix: self.bridge_channel_prefix.clone(),
            publish_timeout: self.bridge_publish_timeout,
            reconnect_max_delay: self.bridge_reconnect_max_delay,
        }
    }
}

/// Read a secret that must be present and at least 32 characters long
fn required_secret(name: &'static str) -> Result<String, ConfigError> {
    let secret = env::var(name).map_err(|_| ConfigError::Missing(name))?;
    if secret.len() < 32 {
        return Err(ConfigError::WeakSecret(name));
    }
    Ok(secret)
}

/// Parse an optional variable, falling back to `default` when unset
fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
    #[error("Weak secret: {0} must be at least 32 characters")]
    WeakSecret(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const OPTIONAL_VARS: &[&str] = &[
        "REDIS_URL",
        "WS_OVERFLOW_POLICY",
        "WS_OUTBOUND_CAPACITY",
        "WS_PING_INTERVAL_SECS",
        "WS_IDLE_TIMEOUT_SECS",
        "QUIET_HOURS_UTC_OFFSET_MINUTES",
        "LOG_FORMAT",
    ];

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        env::set_var(
            "INTERNAL_API_TOKEN",
            "test-internal-token-at-least-32-characters",
        );
        for var in OPTIONAL_VARS {
            env::remove_var(var);
        }
    }

    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("JWT_SECRET");
        env::remove_var("INTERNAL_API_TOKEN");
        for var in OPTIONAL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert!(config.redis_url.is_none());
        assert_eq!(config.ws_overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.ws_outbound_capacity, 256);
        assert_eq!(config.quiet_hours_offset, UtcOffset::UTC);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        setup_minimal_config();
        env::remove_var("DATABASE_URL");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_weak_jwt_secret_rejected() {
        setup_minimal_config();
        env::set_var("JWT_SECRET", "short");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::WeakSecret("JWT_SECRET"))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_overflow_policy_and_offset_parsing() {
        setup_minimal_config();
        env::set_var("WS_OVERFLOW_POLICY", "disconnect");
        env::set_var("QUIET_HOURS_UTC_OFFSET_MINUTES", "480");
        env::set_var("REDIS_URL", "redis://cache:6379");

        let config = Config::from_env().unwrap();
        assert_eq!(config.ws_overflow_policy, OverflowPolicy::Disconnect);
        assert_eq!(config.quiet_hours_offset.whole_hours(), 8);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));

        env::set_var("WS_OVERFLOW_POLICY", "block");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("WS_OVERFLOW_POLICY", _))
        ));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_idle_timeout_must_exceed_ping_interval() {
        setup_minimal_config();
        env::set_var("WS_PING_INTERVAL_SECS", "30");
        env::set_var("WS_IDLE_TIMEOUT_SECS", "30");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("WS_IDLE_TIMEOUT_SECS", _))
        ));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_zero_capacity_rejected() {
        setup_minimal_config();
        env::set_var("WS_OUTBOUND_CAPACITY", "0");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("WS_OUTBOUND_CAPACITY", _))
        ));

        cleanup_config();
    }
}
