//! Configuration module for healthd.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Tuning for the scheduling engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    /// How often the pool monitor samples backlog and idleness
    pub monitor_frequency: Duration,
    /// Idle percentage that counts as "too many workers", and shrink step
    pub stride_percent: usize,
    /// Consecutive idle ticks required before shrinking
    pub shrink_confirm_ticks: u32,
    /// Backlogged units one new worker is expected to absorb
    pub work_per_thread: u64,
    /// Replace workers after this many units (0 disables)
    pub recycle_after_checks: u64,
    pub recycle_every_ticks: u64,
    /// Share of a unit's window it may wait before counting as off-schedule
    pub ttl_threshold_percent: u32,
    pub default_ttl: Duration,
    pub default_timeout: Duration,
    /// Event loop wakeup interval when no timer is armed
    pub empty_poll_interval: Duration,
    /// How long stored results are kept; zero keeps them forever
    pub result_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 256,
            initial_workers: 8,
            monitor_frequency: Duration::from_millis(1000),
            stride_percent: 25,
            shrink_confirm_ticks: 3,
            work_per_thread: 4,
            recycle_after_checks: 10_000,
            recycle_every_ticks: 60,
            ttl_threshold_percent: 10,
            default_ttl: Duration::from_secs(300),
            default_timeout: Duration::from_secs(5),
            empty_poll_interval: Duration::from_secs(1),
            result_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "healthd.db")
    pub db_path: String,
    /// Nameserver for direct lookups; the system resolver is used when unset
    pub nameserver: Option<SocketAddr>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "healthd.db".to_string(),
            nameserver: None,
            engine: EngineConfig::default(),
        }
    }
}

/// Parse `value` into `slot`, keeping the default on failure.
fn apply<T: FromStr>(name: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", name, value),
    }
}

/// Like `apply`, but a zero is rejected as well.
fn apply_nonzero(name: &str, value: &str, slot: &mut u64) {
    match value.parse::<u64>() {
        Ok(0) => tracing::warn!("Ignoring zero value for {}", name),
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", name, value),
    }
}

/// Interval in milliseconds; must be positive.
fn apply_millis(name: &str, value: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    apply_nonzero(name, value, &mut millis);
    *slot = Duration::from_millis(millis);
}

/// Accepts `ip` or `ip:port`, defaulting to port 53.
pub fn parse_nameserver(value: &str) -> Option<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .ok()
        .or_else(|| value.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53)))
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEALTHD_DB_PATH`: Database file path (default: "healthd.db")
    /// - `HEALTHD_NAMESERVER`: `ip[:port]` of the nameserver for direct lookups
    /// - `HEALTHD_MIN_WORKERS`, `HEALTHD_MAX_WORKERS`, `HEALTHD_INITIAL_WORKERS`
    /// - `HEALTHD_MONITOR_FREQUENCY_MS`, `HEALTHD_STRIDE_PERCENT`,
    ///   `HEALTHD_SHRINK_CONFIRM_TICKS`, `HEALTHD_WORK_PER_THREAD`
    /// - `HEALTHD_RECYCLE_AFTER_CHECKS`, `HEALTHD_RECYCLE_EVERY_TICKS`
    /// - `HEALTHD_TTL_THRESHOLD_PERCENT`
    /// - `HEALTHD_DEFAULT_TTL_MS`, `HEALTHD_DEFAULT_TIMEOUT_MS`, `HEALTHD_EMPTY_POLL_MS`
    /// - `HEALTHD_RETENTION_HOURS`: Result retention, 0 keeps everything (default: 168)
    pub fn load() -> Self {
        Self::from_vars(env::vars().filter(|(k, _)| k.starts_with("HEALTHD_")))
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut cfg = Self::default();
        let engine = &mut cfg.engine;

        for (name, value) in vars {
            match name.as_str() {
                "HEALTHD_DB_PATH" => cfg.db_path = value,
                "HEALTHD_NAMESERVER" => match parse_nameserver(&value) {
                    Some(addr) => cfg.nameserver = Some(addr),
                    None => tracing::warn!("Ignoring invalid nameserver: {:?}", value),
                },
                "HEALTHD_MIN_WORKERS" => apply(&name, &value, &mut engine.min_workers),
                "HEALTHD_MAX_WORKERS" => apply(&name, &value, &mut engine.max_workers),
                "HEALTHD_INITIAL_WORKERS" => apply(&name, &value, &mut engine.initial_workers),
                "HEALTHD_MONITOR_FREQUENCY_MS" => {
                    apply_millis(&name, &value, &mut engine.monitor_frequency)
                }
                "HEALTHD_STRIDE_PERCENT" => apply(&name, &value, &mut engine.stride_percent),
                "HEALTHD_SHRINK_CONFIRM_TICKS" => {
                    apply(&name, &value, &mut engine.shrink_confirm_ticks)
                }
                "HEALTHD_WORK_PER_THREAD" => {
                    apply_nonzero(&name, &value, &mut engine.work_per_thread)
                }
                "HEALTHD_RECYCLE_AFTER_CHECKS" => {
                    apply(&name, &value, &mut engine.recycle_after_checks)
                }
                "HEALTHD_RECYCLE_EVERY_TICKS" => {
                    apply_nonzero(&name, &value, &mut engine.recycle_every_ticks)
                }
                "HEALTHD_TTL_THRESHOLD_PERCENT" => {
                    apply(&name, &value, &mut engine.ttl_threshold_percent)
                }
                "HEALTHD_DEFAULT_TTL_MS" => apply_millis(&name, &value, &mut engine.default_ttl),
                "HEALTHD_DEFAULT_TIMEOUT_MS" => {
                    apply_millis(&name, &value, &mut engine.default_timeout)
                }
                "HEALTHD_EMPTY_POLL_MS" => {
                    apply_millis(&name, &value, &mut engine.empty_poll_interval)
                }
                "HEALTHD_RETENTION_HOURS" => {
                    let mut hours = engine.result_retention.as_secs() / 3600;
                    apply(&name, &value, &mut hours);
                    match hours.checked_mul(3600) {
                        Some(secs) => engine.result_retention = Duration::from_secs(secs),
                        None => tracing::warn!("Ignoring out-of-range value for {}: {:?}", name, value),
                    }
                }
                _ => tracing::debug!("Unknown configuration variable {}", name),
            }
        }

        engine.initial_workers = engine
            .initial_workers
            .clamp(engine.min_workers, engine.max_workers.max(engine.min_workers));
        cfg
    }
}
