//! Service configuration from environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use collector_queue::{RetryPolicy, WorkerPoolConfig};
use uuid::Uuid;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which queue backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Postgres,
    Fifo,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "fifo" | "list" => Ok(Self::Fifo),
            other => Err(format!("expected memory, postgres or fifo, got {other}")),
        }
    }
}

/// Time-series store connection
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Options passed to every SNMP request
#[derive(Debug, Clone)]
pub struct SnmpConfig {
    pub version: String,
    pub retries: u32,
    pub timeout: Duration,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            version: "2c".to_string(),
            retries: 1,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub backend: BackendKind,
    pub database_url: Option<String>,
    pub consumer_id: String,
    pub threads: usize,
    pub lease_duration: Duration,
    pub max_attempts: u32,
    pub requeue_on_fail: bool,
    pub pop_timeout: Duration,
    pub stats_interval: Duration,
    pub shutdown_timeout: Duration,
    pub jobs_file: Option<PathBuf>,
    pub influx: InfluxConfig,
    pub snmp: SnmpConfig,
}

impl ServiceConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `QUEUE_BACKEND`: `memory`, `postgres` or `fifo` (default: memory)
    /// - `DATABASE_URL`: required for the postgres backend
    /// - `CONSUMER`: consumer identity prefix (default: "collector-<uuid>")
    /// - `THREADS`: number of workers (default: 4)
    /// - `LEASE_SECS`, `MAX_ATTEMPTS`, `REQUEUE_ON_FAIL`: lease and retry policy
    /// - `POP_TIMEOUT_MS`: FIFO blocking pop bound (default: 500)
    /// - `STATS_INTERVAL_SECS`, `SHUTDOWN_TIMEOUT_SECS`
    /// - `JOBS_FILE`: JSON array of payloads enqueued at startup
    /// - `INFLUX_URL`, `INFLUX_DB`, `INFLUX_USER`, `INFLUX_PASSWORD`
    /// - `SNMP_VERSION`, `SNMP_RETRIES`, `SNMP_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = parse_or(&var, "QUEUE_BACKEND", BackendKind::Memory)?;
        let database_url = var("DATABASE_URL");
        if backend == BackendKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let threads: usize = parse_or(&var, "THREADS", 4)?;
        if threads == 0 {
            return Err(ConfigError::Invalid {
                key: "THREADS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        let max_attempts: u32 = parse_or(&var, "MAX_ATTEMPTS", 3)?;
        if i32::try_from(max_attempts).is_err() {
            return Err(ConfigError::Invalid {
                key: "MAX_ATTEMPTS",
                value: max_attempts.to_string(),
                reason: format!("must not exceed {}", i32::MAX),
            });
        }
        let stats_interval_secs: u64 = parse_or(&var, "STATS_INTERVAL_SECS", 1)?;

        Ok(Self {
            backend,
            database_url,
            consumer_id: var("CONSUMER").unwrap_or_else(|| format!("collector-{}", Uuid::now_v7())),
            threads,
            lease_duration: Duration::from_secs(parse_or(&var, "LEASE_SECS", 300)?),
            max_attempts: max_attempts.max(1),
            requeue_on_fail: parse_bool_or(&var, "REQUEUE_ON_FAIL", true)?,
            pop_timeout: Duration::from_millis(parse_or(&var, "POP_TIMEOUT_MS", 500)?),
            stats_interval: Duration::from_secs(stats_interval_secs.max(1)),
            shutdown_timeout: Duration::from_secs(parse_or(&var, "SHUTDOWN_TIMEOUT_SECS", 30)?),
            jobs_file: var("JOBS_FILE").map(PathBuf::from),
            influx: InfluxConfig {
                url: var("INFLUX_URL").unwrap_or_else(|| "http://localhost:8086".to_string()),
                database: var("INFLUX_DB").unwrap_or_else(|| "collector".to_string()),
                username: var("INFLUX_USER"),
                password: var("INFLUX_PASSWORD"),
            },
            snmp: SnmpConfig {
                version: var("SNMP_VERSION").unwrap_or_else(|| "2c".to_string()),
                retries: parse_or(&var, "SNMP_RETRIES", 1)?,
                timeout: Duration::from_secs(parse_or(&var, "SNMP_TIMEOUT_SECS", 1)?),
            },
        })
    }

    /// Retry policy for lease backends
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_requeue_on_fail(self.requeue_on_fail)
    }

    /// Worker pool configuration
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.threads)
            .with_consumer_id(self.consumer_id.clone())
            .with_lease_duration(self.lease_duration)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool_or(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match var(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert!(config.consumer_id.starts_with("collector-"));
        assert_eq!(config.threads, 4);
        assert_eq!(config.lease_duration, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 3);
        assert!(config.requeue_on_fail);
        assert_eq!(config.pop_timeout, Duration::from_millis(500));
        assert_eq!(config.stats_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.jobs_file.is_none());
        assert_eq!(config.influx.url, "http://localhost:8086");
        assert_eq!(config.influx.database, "collector");
        assert_eq!(config.snmp.version, "2c");
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("QUEUE_BACKEND", "fifo"),
            ("CONSUMER", "poller-7"),
            ("THREADS", "16"),
            ("MAX_ATTEMPTS", "5"),
            ("REQUEUE_ON_FAIL", "false"),
            ("POP_TIMEOUT_MS", "250"),
            ("JOBS_FILE", "/etc/collector/jobs.json"),
            ("INFLUX_USER", "root"),
        ])
        .unwrap();

        assert_eq!(config.backend, BackendKind::Fifo);
        assert_eq!(config.consumer_id, "poller-7");
        assert_eq!(config.threads, 16);
        assert_eq!(config.pop_timeout, Duration::from_millis(250));
        assert_eq!(config.jobs_file, Some(PathBuf::from("/etc/collector/jobs.json")));
        assert_eq!(config.influx.username.as_deref(), Some("root"));

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert!(!policy.requeue_on_fail);

        let pool = config.pool_config();
        assert_eq!(pool.consumer_id, "poller-7");
        assert_eq!(pool.concurrency, 16);
    }

    #[test]
    fn test_postgres_requires_database_url() {
        assert!(matches!(
            config_from(&[("QUEUE_BACKEND", "postgres")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        let config = config_from(&[
            ("QUEUE_BACKEND", "postgres"),
            ("DATABASE_URL", "postgres://localhost/collector"),
        ])
        .unwrap();
        assert_eq!(config.backend, BackendKind::Postgres);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("THREADS", "many")]),
            Err(ConfigError::Invalid { key: "THREADS", .. })
        ));
        assert!(matches!(
            config_from(&[("THREADS", "0")]),
            Err(ConfigError::Invalid { key: "THREADS", .. })
        ));
        assert!(matches!(
            config_from(&[("REQUEUE_ON_FAIL", "maybe")]),
            Err(ConfigError::Invalid { key: "REQUEUE_ON_FAIL", .. })
        ));
        assert!(matches!(
            config_from(&[("MAX_ATTEMPTS", "3000000000")]),
            Err(ConfigError::Invalid { key: "MAX_ATTEMPTS", .. })
        ));
        assert!(matches!(
            config_from(&[("QUEUE_BACKEND", "redis")]),
            Err(ConfigError::Invalid { key: "QUEUE_BACKEND", .. })
        ));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config_from(&[("THREADS", "  "), ("CONSUMER", "")]).unwrap();
        assert_eq!(config.threads, 4);
        assert!(config.consumer_id.starts_with("collector-"));
    }
}
