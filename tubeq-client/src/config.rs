//! Pool configuration with environment overrides.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default broker address.
pub(crate) const DEFAULT_ADDR: &str = "127.0.0.1:11300";
pub(crate) const DEFAULT_CAPACITY: usize = 8;
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Fixed dial budget for new connections.
pub(crate) const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Broker address as `host:port`.
    pub addr: String,
    /// Maximum number of live connections (idle + checked out).
    pub capacity: usize,
    /// Idle connections older than this are closed. Zero disables eviction.
    pub idle_timeout: Duration,
    /// TCP connect timeout for each dial.
    pub dial_timeout: Duration,
    /// Optional TCP read timeout. Must exceed any reserve timeout in use.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            addr: DEFAULT_ADDR.to_string(),
            capacity: DEFAULT_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Defaults overlaid with `TUBEQ_*` environment variables.
    ///
    /// Recognised: `TUBEQ_ADDR`, `TUBEQ_POOL_CAPACITY`,
    /// `TUBEQ_IDLE_TIMEOUT_SECS`, `TUBEQ_DIAL_TIMEOUT_MS`,
    /// `TUBEQ_READ_TIMEOUT_MS`, `TUBEQ_WRITE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = PoolConfig::default();
        if let Some(addr) = lookup("TUBEQ_ADDR").filter(|addr| !addr.trim().is_empty()) {
            config.addr = addr.trim().to_string();
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "TUBEQ_POOL_CAPACITY") {
            config.capacity = capacity;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TUBEQ_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TUBEQ_DIAL_TIMEOUT_MS") {
            config.dial_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TUBEQ_READ_TIMEOUT_MS") {
            config.read_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TUBEQ_WRITE_TIMEOUT_MS") {
            config.write_timeout = Some(Duration::from_millis(ms));
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = PoolConfig::from_lookup(lookup(&[]));
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.read_timeout, None);
    }

    #[test]
    fn applies_overrides() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("TUBEQ_ADDR", " queue.internal:11300 "),
            ("TUBEQ_POOL_CAPACITY", "32"),
            ("TUBEQ_IDLE_TIMEOUT_SECS", "0"),
            ("TUBEQ_READ_TIMEOUT_MS", "1500"),
        ]));
        assert_eq!(config.addr, "queue.internal:11300");
        assert_eq!(config.capacity, 32);
        assert_eq!(config.idle_timeout, Duration::ZERO);
        assert_eq!(config.read_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn bad_values_fall_back() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("TUBEQ_POOL_CAPACITY", "lots"),
            ("TUBEQ_DIAL_TIMEOUT_MS", "-5"),
        ]));
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.dial_timeout, DEFAULT_DIAL_TIMEOUT);
    }
}
