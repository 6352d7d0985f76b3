use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONCURRENT_DISPATCH: usize = 16;
pub const DEFAULT_MAX_STORE_FAILURES: u32 = 3;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SINK_CAPACITY: usize = 256;
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB per enqueued task
pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
///
/// Read once at process start; nothing is reloaded while the scheduler runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Job names are unique within this namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// IANA timezone applied to cron schedules registered without one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_dispatch")]
    pub max_concurrent_dispatch: usize,
    /// Consecutive failed scans tolerated before the loop halts.
    #[serde(default = "default_max_store_failures")]
    pub max_store_failures: u32,
    /// Occurrences claimed later than this are advanced but not enqueued.
    #[serde(default)]
    pub misfire_grace_secs: Option<u64>,
    /// Reject interval periods that the poll interval cannot honour.
    #[serde(default)]
    pub enforce_poll_granularity: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            poll_interval_secs: default_poll_interval_secs(),
            default_timezone: default_timezone(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            max_concurrent_dispatch: default_max_concurrent_dispatch(),
            max_store_failures: default_max_store_failures(),
            misfire_grace_secs: None,
            enforce_poll_granularity: false,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn misfire_grace(&self) -> Option<Duration> {
        self.misfire_grace_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Bounded capacity of the in-process delivery channel.
    #[serde(default = "default_sink_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: default_sink_capacity(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// When false no health endpoint is served.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_enqueue_timeout_ms() -> u64 {
    DEFAULT_ENQUEUE_TIMEOUT_MS
}
fn default_max_concurrent_dispatch() -> usize {
    DEFAULT_MAX_CONCURRENT_DISPATCH
}
fn default_max_store_failures() -> u32 {
    DEFAULT_MAX_STORE_FAILURES
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_sink_capacity() -> usize {
    DEFAULT_SINK_CAPACITY
}
fn default_max_payload_bytes() -> usize {
    MAX_PAYLOAD_BYTES
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// Nested keys in env vars use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__POLL_INTERVAL_SECS=30`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::from(Serialized::defaults(CadenceConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.namespace.trim().is_empty() {
            return Err(CadenceError::Config("scheduler.namespace must not be empty".into()));
        }
        if s.poll_interval_secs == 0 {
            return Err(CadenceError::Config(
                "scheduler.poll_interval_secs must be positive".into(),
            ));
        }
        if s.enqueue_timeout_ms == 0 {
            return Err(CadenceError::Config(
                "scheduler.enqueue_timeout_ms must be positive".into(),
            ));
        }
        if s.max_concurrent_dispatch == 0 {
            return Err(CadenceError::Config(
                "scheduler.max_concurrent_dispatch must be at least 1".into(),
            ));
        }
        if s.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(CadenceError::Config(format!(
                "scheduler.default_timezone is not an IANA timezone: {}",
                s.default_timezone
            )));
        }
        if self.sink.capacity == 0 {
            return Err(CadenceError::Config("sink.capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
