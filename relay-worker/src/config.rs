//! Configuration module for environment variable parsing.
//!
//! Everything except the accounts themselves comes from the environment.
//! Accounts live in the YAML file pointed to by `FLOWERINBOX_ACCOUNTS_FILE`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::util::retry::RetryPolicy;

/// Default location of the accounts file, relative to the working directory.
pub const DEFAULT_ACCOUNTS_FILE: &str = "./config/accounts.yml";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the YAML accounts file
    pub accounts_file: PathBuf,

    /// Port for the trigger server to listen on
    pub port: u16,

    /// Per-call timeout for outbound webhook requests in milliseconds
    pub webhook_timeout_ms: u64,

    /// Total number of attempts for a webhook call that keeps failing to connect
    pub webhook_max_attempts: u32,

    /// Fixed delay between two attempts in milliseconds
    pub webhook_retry_delay_ms: u64,

    /// Time-to-live of the cached accounts file in seconds
    pub accounts_cache_ttl_secs: u64,

    /// Timeout for establishing an IMAP session in milliseconds
    pub imap_timeout_ms: u64,

    /// Whether cron jobs declared on webhooks are registered at startup
    pub cron_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            accounts_file: PathBuf::from(DEFAULT_ACCOUNTS_FILE),
            port: 7000,
            webhook_timeout_ms: 5_000,
            webhook_max_attempts: 3,
            webhook_retry_delay_ms: 60_000,
            accounts_cache_ttl_secs: 300,
            imap_timeout_ms: 30_000,
            cron_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            accounts_file: env::var("FLOWERINBOX_ACCOUNTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.accounts_file),

            port: parse_number("PORT", defaults.port),

            webhook_timeout_ms: parse_number("WEBHOOK_TIMEOUT_MS", defaults.webhook_timeout_ms),

            webhook_max_attempts: parse_number(
                "WEBHOOK_MAX_ATTEMPTS",
                defaults.webhook_max_attempts,
            )
            .max(1),

            webhook_retry_delay_ms: parse_number(
                "WEBHOOK_RETRY_DELAY_MS",
                defaults.webhook_retry_delay_ms,
            ),

            accounts_cache_ttl_secs: parse_number(
                "ACCOUNTS_CACHE_TTL_SECS",
                defaults.accounts_cache_ttl_secs,
            ),

            imap_timeout_ms: parse_number("IMAP_TIMEOUT_MS", defaults.imap_timeout_ms),

            cron_enabled: parse_bool("FLOWERINBOX_CRON_ENABLED", defaults.cron_enabled),
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn accounts_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.accounts_cache_ttl_secs)
    }

    pub fn imap_timeout(&self) -> Duration {
        Duration::from_millis(self.imap_timeout_ms)
    }

    /// Retry policy applied to every outbound webhook call.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.webhook_max_attempts,
            delay: Duration::from_millis(self.webhook_retry_delay_ms),
        }
    }
}

/// Parse a numeric variable, falling back to `default` when unset or malformed.
fn parse_number<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid number, using default");
            default
        }
    }
}

/// Parse a boolean variable. Accepts `true/false`, `1/0`, `yes/no`.
fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}
