// Configuration for the router
//
// Configuration is loaded from environment variables (the deployment
// platform injects them); a handful of CLI flags can override the
// listen address for local runs. Required variables are the two backend
// URLs and the coordination database; everything else has defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Retention windows for the auxiliary log tables, in days.
///
/// High-frequency monitoring data gets short retention, operational
/// history keeps longer. Each window is env-tunable.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub health_metrics_days: u32,
    pub performance_metrics_days: u32,
    pub sync_history_days: u32,
    pub failover_events_days: u32,
    pub sync_tasks_days: u32,
    pub sync_workers_days: u32,
    /// How often the cleanup task runs
    pub cleanup_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            health_metrics_days: 7,
            performance_metrics_days: 30,
            sync_history_days: 90,
            failover_events_days: 180,
            sync_tasks_days: 30,
            sync_workers_days: 7,
            cleanup_interval: Duration::from_secs(6 * 3600),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// When set, also write daily-rolling log files here
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Full router configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the router listens on
    pub bind_addr: SocketAddr,
    /// Base URL of the primary instance
    pub primary_url: String,
    /// Base URL of the replica instance
    pub replica_url: String,
    /// Path to the SQLite coordination database
    pub database_path: PathBuf,
    /// Outbound HTTP concurrency cap
    pub max_workers: usize,
    /// Share of reads preferring the replica (0.0 - 1.0)
    pub read_replica_ratio: f64,
    /// Health probe cadence
    pub health_check_interval: Duration,
    /// Consecutive probe failures before an instance is marked unhealthy
    pub health_failure_threshold: u32,
    /// Replayer claim batch size
    pub wal_batch_size: usize,
    /// Per-WAL-entry retry budget
    pub wal_retry_max: u32,
    /// Replayer pass interval (shrinks under backlog)
    pub wal_sync_interval: Duration,
    /// Outbound forward timeout
    pub request_timeout: Duration,
    /// RSS budget for memory pressure detection
    pub memory_limit_mb: u64,
    /// Fraction of the RSS budget that trips pressure
    pub memory_pressure_ratio: f64,
    /// ATTEMPTING transactions older than this are eligible for recovery
    pub txn_stuck_after: Duration,
    /// Optional Slack webhook for operational alerts
    pub slack_webhook_url: Option<String>,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Fails (and the process exits non-zero) when a required variable is
    /// missing or any variable fails to parse. Missing optional variables
    /// fall back to defaults.
    pub fn from_env() -> Result<Self> {
        let primary_url = require_env("PRIMARY_URL")?;
        let replica_url = require_env("REPLICA_URL")?;
        let database_path = parse_database_url(&require_env("DATABASE_URL")?)?;

        let bind_addr: SocketAddr = env_or("BIND_ADDR", "0.0.0.0:8000")
            .parse()
            .context("BIND_ADDR is not a valid socket address")?;

        let retention = RetentionConfig {
            health_metrics_days: env_parse("HEALTH_METRICS_RETENTION_DAYS", 7)?,
            performance_metrics_days: env_parse("PERFORMANCE_METRICS_RETENTION_DAYS", 30)?,
            sync_history_days: env_parse("SYNC_HISTORY_RETENTION_DAYS", 90)?,
            failover_events_days: env_parse("FAILOVER_EVENTS_RETENTION_DAYS", 180)?,
            sync_tasks_days: env_parse("SYNC_TASKS_RETENTION_DAYS", 30)?,
            sync_workers_days: env_parse("SYNC_WORKERS_RETENTION_DAYS", 7)?,
            cleanup_interval: Duration::from_secs(
                env_parse::<u64>("CLEANUP_INTERVAL_HOURS", 6)? * 3600,
            ),
        };

        let logging = LoggingConfig {
            level: env_or("LOG_LEVEL", "info"),
            log_dir: std::env::var("LOG_DIR").ok().map(PathBuf::from),
        };

        Ok(Self {
            bind_addr,
            primary_url: normalize_base_url(&primary_url),
            replica_url: normalize_base_url(&replica_url),
            database_path,
            max_workers: env_parse("MAX_WORKERS", 8)?,
            read_replica_ratio: parse_ratio(&env_or("READ_REPLICA_RATIO", "0.8"))?,
            health_check_interval: Duration::from_secs(env_parse(
                "HEALTH_CHECK_INTERVAL_SECONDS",
                30,
            )?),
            health_failure_threshold: env_parse("HEALTH_FAILURE_THRESHOLD", 3)?,
            wal_batch_size: env_parse("WAL_BATCH_SIZE", 50)?,
            wal_retry_max: env_parse("WAL_RETRY_MAX", 3)?,
            wal_sync_interval: Duration::from_secs(env_parse("WAL_SYNC_INTERVAL_SECONDS", 10)?),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECONDS", 30)?),
            memory_limit_mb: env_parse("MEMORY_LIMIT_MB", 512)?,
            memory_pressure_ratio: parse_ratio(&env_or("MEMORY_PRESSURE_RATIO", "0.85"))?,
            txn_stuck_after: Duration::from_secs(env_parse::<u64>("TXN_STUCK_MINUTES", 30)? * 60),
            slack_webhook_url: std::env::var("SLACK_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            retention,
            logging,
        })
    }

    /// Memory pressure threshold in bytes
    pub fn memory_pressure_bytes(&self) -> u64 {
        ((self.memory_limit_mb * 1024 * 1024) as f64 * self.memory_pressure_ratio) as u64
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("required environment variable {name} is not set"),
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{name}={v:?} is not a valid value")),
        Err(_) => Ok(default),
    }
}

/// Accept `sqlite:///var/data/vecgate.db`, `sqlite://vecgate.db`, or a bare
/// file path. Anything else (e.g. a postgres URL) is rejected up front.
fn parse_database_url(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("sqlite://") {
        if rest.is_empty() {
            bail!("DATABASE_URL has an empty path");
        }
        return Ok(PathBuf::from(rest));
    }
    if raw.contains("://") {
        bail!("DATABASE_URL must be a SQLite path, got scheme {raw:?}");
    }
    Ok(PathBuf::from(raw))
}

/// Strip a trailing slash so path concatenation stays predictable
fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn parse_ratio(raw: &str) -> Result<f64> {
    let v: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{raw:?} is not a number"))?;
    if !(0.0..=1.0).contains(&v) {
        bail!("ratio {v} is out of range (expected 0.0 - 1.0)");
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_accepts_sqlite_scheme() {
        let path = parse_database_url("sqlite:///var/data/vecgate.db").unwrap();
        assert_eq!(path, PathBuf::from("/var/data/vecgate.db"));
    }

    #[test]
    fn database_url_accepts_bare_path() {
        let path = parse_database_url("./vecgate.db").unwrap();
        assert_eq!(path, PathBuf::from("./vecgate.db"));
    }

    #[test]
    fn database_url_rejects_other_schemes() {
        assert!(parse_database_url("postgres://host/db").is_err());
    }

    #[test]
    fn ratio_bounds_are_enforced() {
        assert!(parse_ratio("0.0").is_ok());
        assert!(parse_ratio("1.0").is_ok());
        assert!(parse_ratio("1.5").is_err());
        assert!(parse_ratio("-0.1").is_err());
        assert!(parse_ratio("replica").is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        assert_eq!(
            normalize_base_url("https://primary.example.com/"),
            "https://primary.example.com"
        );
    }
}
