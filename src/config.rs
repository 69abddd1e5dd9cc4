//! Configuration management

use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::{CircuitBreakerConfig, RetryPolicy};

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: IpAddr,

    /// HTTP port (default: 8080)
    pub port: u16,

    /// Resource units that may be approved at once
    pub resource_ceiling: u32,

    /// Alternative strategies tried after the primary one
    pub max_alternatives: usize,

    /// Deadline applied when a task does not carry one
    pub default_timeout_ms: u64,

    /// Largest deadline a task may ask for
    pub max_timeout_ms: u64,

    pub max_retries: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,

    pub breaker_failure_threshold: usize,
    pub breaker_success_threshold: usize,
    pub breaker_open_secs: u64,

    /// Entries kept per context history
    pub history_limit: usize,

    /// Idempotency ledger size and retention
    pub ledger_capacity: u64,
    pub ledger_ttl_secs: u64,

    /// SQLite context store (in-memory store when unset)
    pub sqlite_path: Option<PathBuf>,

    /// JSON-lines mirror of the audit log
    pub audit_path: Option<PathBuf>,

    /// Log as JSON instead of human-readable text
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            resource_ceiling: 8,
            max_alternatives: 3,
            default_timeout_ms: 60_000,
            max_timeout_ms: 300_000,
            max_retries: 3,
            retry_initial_ms: 2_000,
            retry_max_ms: 30_000,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_open_secs: 30,
            history_limit: 50,
            ledger_capacity: 10_000,
            ledger_ttl_secs: 3600,
            sqlite_path: None,
            audit_path: None,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str| {
            lookup(key)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
        };

        let config = Self {
            bind_addr: parse_or(&lookup, "ARCHMERGE_BIND_ADDR", defaults.bind_addr)?,
            port: parse_or(&lookup, "ARCHMERGE_PORT", defaults.port)?,
            resource_ceiling: parse_or(&lookup, "ARCHMERGE_RESOURCE_CEILING", defaults.resource_ceiling)?,
            max_alternatives: parse_or(&lookup, "ARCHMERGE_MAX_ALTERNATIVES", defaults.max_alternatives)?,
            default_timeout_ms: parse_or(&lookup, "ARCHMERGE_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms)?,
            max_timeout_ms: parse_or(&lookup, "ARCHMERGE_MAX_TIMEOUT_MS", defaults.max_timeout_ms)?,
            max_retries: parse_or(&lookup, "ARCHMERGE_MAX_RETRIES", defaults.max_retries)?,
            retry_initial_ms: parse_or(&lookup, "ARCHMERGE_RETRY_INITIAL_MS", defaults.retry_initial_ms)?,
            retry_max_ms: parse_or(&lookup, "ARCHMERGE_RETRY_MAX_MS", defaults.retry_max_ms)?,
            breaker_failure_threshold: parse_or(
                &lookup,
                "ARCHMERGE_BREAKER_FAILURES",
                defaults.breaker_failure_threshold,
            )?,
            breaker_success_threshold: parse_or(
                &lookup,
                "ARCHMERGE_BREAKER_SUCCESSES",
                defaults.breaker_success_threshold,
            )?,
            breaker_open_secs: parse_or(&lookup, "ARCHMERGE_BREAKER_OPEN_SECS", defaults.breaker_open_secs)?,
            history_limit: parse_or(&lookup, "ARCHMERGE_HISTORY_LIMIT", defaults.history_limit)?,
            ledger_capacity: parse_or(&lookup, "ARCHMERGE_LEDGER_CAPACITY", defaults.ledger_capacity)?,
            ledger_ttl_secs: parse_or(&lookup, "ARCHMERGE_LEDGER_TTL_SECS", defaults.ledger_ttl_secs)?,
            sqlite_path: lookup("ARCHMERGE_SQLITE_PATH")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            audit_path: lookup("ARCHMERGE_AUDIT_PATH")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            log_json: flag("ARCHMERGE_LOG_JSON"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.resource_ceiling == 0 {
            bail!("ARCHMERGE_RESOURCE_CEILING must be at least 1");
        }
        if self.default_timeout_ms == 0 || self.default_timeout_ms > self.max_timeout_ms {
            bail!(
                "ARCHMERGE_DEFAULT_TIMEOUT_MS must be within 1..={}",
                self.max_timeout_ms
            );
        }
        if self.breaker_failure_threshold == 0 || self.breaker_success_threshold == 0 {
            bail!("circuit breaker thresholds must be at least 1");
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn is_localhost(&self) -> bool {
        self.bind_addr.is_loopback()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            open_duration: Duration::from_secs(self.breaker_open_secs),
        }
    }

    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_secs)
    }

    /// Effective deadline for a task's requested timeout (0 = default)
    pub fn effective_timeout_ms(&self, requested: u64) -> u64 {
        if requested == 0 {
            self.default_timeout_ms
        } else {
            requested
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_alternatives, 3);
        assert!(config.is_localhost());
        assert!(config.sqlite_path.is_none());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.breaker_config().failure_threshold, 5);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ARCHMERGE_PORT", "9090"),
            ("ARCHMERGE_BIND_ADDR", "0.0.0.0"),
            ("ARCHMERGE_RESOURCE_CEILING", "2"),
            ("ARCHMERGE_SQLITE_PATH", "/tmp/ctx.db"),
            ("ARCHMERGE_LOG_JSON", "1"),
        ]))
        .unwrap();

        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:9090");
        assert!(!config.is_localhost());
        assert_eq!(config.resource_ceiling, 2);
        assert_eq!(config.sqlite_path, Some(PathBuf::from("/tmp/ctx.db")));
        assert!(config.log_json);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = Config::from_lookup(lookup(&[("ARCHMERGE_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("ARCHMERGE_PORT"));

        assert!(Config::from_lookup(lookup(&[("ARCHMERGE_RESOURCE_CEILING", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("ARCHMERGE_DEFAULT_TIMEOUT_MS", "999999")])).is_err());
    }

    #[test]
    fn test_effective_timeout() {
        let config = Config::default();
        assert_eq!(config.effective_timeout_ms(0), 60_000);
        assert_eq!(config.effective_timeout_ms(250), 250);
    }
}
