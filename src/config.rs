//! Configuration Module
//!
//! Handles loading and managing optimizer configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::DEFAULT_KEY_PREFIX;
use crate::dedup::DedupConfig;

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    /// TTL in seconds for paths no rule matches
    pub default_ttl: u64,
    /// Seconds a settled success is replayed to repeat callers
    pub dedup_echo_window: u64,
    /// Seconds an in-flight execution may run before waiters time out
    pub dedup_max_lifetime: u64,
    /// Requests slower than this many milliseconds are reported
    pub slow_request_ms: u64,
    /// Background cleanup task interval in seconds
    pub cleanup_interval: u64,
    /// Prefix of every cache key in the backend
    pub cache_key_prefix: String,
    /// Events buffered per event-bus subscriber
    pub event_channel_capacity: usize,
    /// Optional JSON rules file; built-in rules are used without it
    pub rules_file: Option<PathBuf>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 3037)
    /// - `DEFAULT_TTL` - Fallback TTL in seconds (default: 300)
    /// - `DEDUP_ECHO_WINDOW` - Echo window in seconds (default: 30)
    /// - `DEDUP_MAX_LIFETIME` - In-flight ceiling in seconds (default: 30)
    /// - `SLOW_REQUEST_MS` - Slow request threshold in ms (default: 1000)
    /// - `CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 60)
    /// - `CACHE_KEY_PREFIX` - Backend key prefix (default: `cache:`)
    /// - `EVENT_CHANNEL_CAPACITY` - Event buffer per subscriber (default: 1024)
    /// - `RULES_FILE` - Path to a JSON rule list (default: unset)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_port: env_or("SERVER_PORT", defaults.server_port),
            default_ttl: env_or("DEFAULT_TTL", defaults.default_ttl),
            dedup_echo_window: env_or("DEDUP_ECHO_WINDOW", defaults.dedup_echo_window),
            dedup_max_lifetime: env_or("DEDUP_MAX_LIFETIME", defaults.dedup_max_lifetime),
            slow_request_ms: env_or("SLOW_REQUEST_MS", defaults.slow_request_ms),
            cleanup_interval: env_or("CLEANUP_INTERVAL", defaults.cleanup_interval),
            cache_key_prefix: env::var("CACHE_KEY_PREFIX").unwrap_or(defaults.cache_key_prefix),
            event_channel_capacity: env_or("EVENT_CHANNEL_CAPACITY", defaults.event_channel_capacity),
            rules_file: env::var("RULES_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            echo_window: Duration::from_secs(self.dedup_echo_window),
            // Zero would time every execution out immediately.
            max_lifetime: Duration::from_secs(self.dedup_max_lifetime.max(1)),
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3037,
            default_ttl: 300,
            dedup_echo_window: 30,
            dedup_max_lifetime: 30,
            slow_request_ms: 1000,
            cleanup_interval: 60,
            cache_key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            event_channel_capacity: 1024,
            rules_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server_port, 3037);
        assert_eq!(config.default_ttl, 300);
        assert_eq!(config.dedup_echo_window, 30);
        assert_eq!(config.dedup_max_lifetime, 30);
        assert_eq!(config.slow_request_ms, 1000);
        assert_eq!(config.cleanup_interval, 60);
        assert_eq!(config.cache_key_prefix, "cache:");
        assert!(config.rules_file.is_none());
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        for name in [
            "SERVER_PORT",
            "DEFAULT_TTL",
            "DEDUP_ECHO_WINDOW",
            "DEDUP_MAX_LIFETIME",
            "SLOW_REQUEST_MS",
            "CLEANUP_INTERVAL",
            "CACHE_KEY_PREFIX",
            "EVENT_CHANNEL_CAPACITY",
            "RULES_FILE",
        ] {
            env::remove_var(name);
        }

        let config = Config::from_env();
        assert_eq!(config.server_port, 3037);
        assert_eq!(config.default_ttl, 300);
        assert_eq!(config.event_channel_capacity, 1024);
        assert!(config.rules_file.is_none());
    }

    #[test]
    fn test_dedup_config_conversion() {
        let config = Config {
            dedup_echo_window: 0,
            dedup_max_lifetime: 0,
            ..Config::default()
        };
        let dedup = config.dedup_config();
        assert!(dedup.echo_window.is_zero());
        assert_eq!(dedup.max_lifetime, Duration::from_secs(1));
        assert_eq!(config.slow_threshold(), Duration::from_millis(1000));
    }
}
