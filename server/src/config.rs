//! Server configuration

use crate::error::ConfigError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracker_shared::timing;

pub const ENV_LISTEN_ADDR: &str = "TRACKER_LISTEN_ADDR";
pub const ENV_ADMIN_ADDR: &str = "TRACKER_ADMIN_ADDR";
pub const ENV_MAX_IDLE_SECS: &str = "TRACKER_MAX_IDLE_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "TRACKER_SWEEP_INTERVAL_SECS";
pub const ENV_SINK_CAPACITY: &str = "TRACKER_SINK_CAPACITY";

/// Configuration for the ingest server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Device-facing TCP listen address
    pub listen_addr: SocketAddr,
    /// Admin console address (disabled when `None`)
    pub admin_addr: Option<SocketAddr>,
    /// Idle time after which the sweeper evicts a session
    pub max_idle: Duration,
    /// Sweeper period
    pub sweep_interval: Duration,
    /// Per-connection backend queue depth
    pub sink_capacity: usize,
    /// Socket read buffer size
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5020)),
            admin_addr: None,
            max_idle: Duration::from_secs(timing::SESSION_MAX_IDLE_SECS),
            sweep_interval: Duration::from_secs(timing::SWEEP_INTERVAL_SECS),
            sink_capacity: 256,
            read_buffer_size: 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TRACKER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_LISTEN_ADDR) {
            config.listen_addr = parse(ENV_LISTEN_ADDR, &v)?;
        }
        if let Some(v) = lookup(ENV_ADMIN_ADDR) {
            config.admin_addr = if v.trim().is_empty() {
                None
            } else {
                Some(parse(ENV_ADMIN_ADDR, &v)?)
            };
        }
        if let Some(v) = lookup(ENV_MAX_IDLE_SECS) {
            config.max_idle = Duration::from_secs(parse(ENV_MAX_IDLE_SECS, &v)?);
        }
        if let Some(v) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            let secs: u64 = parse(ENV_SWEEP_INTERVAL_SECS, &v)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_SWEEP_INTERVAL_SECS,
                    value: v,
                    reason: "must be at least 1".into(),
                });
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = lookup(ENV_SINK_CAPACITY) {
            let capacity: usize = parse(ENV_SINK_CAPACITY, &v)?;
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_SINK_CAPACITY,
                    value: v,
                    reason: "must be at least 1".into(),
                });
            }
            config.sink_capacity = capacity;
        }

        Ok(config)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.listen_addr.port(), 5020);
        assert!(config.admin_addr.is_none());
        assert_eq!(config.max_idle, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            (ENV_LISTEN_ADDR, "127.0.0.1:7000"),
            (ENV_ADMIN_ADDR, "127.0.0.1:7001"),
            (ENV_MAX_IDLE_SECS, "60"),
            (ENV_SWEEP_INTERVAL_SECS, "5"),
            (ENV_SINK_CAPACITY, "8"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.admin_addr, Some("127.0.0.1:7001".parse().unwrap()));
        assert_eq!(config.max_idle, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.sink_capacity, 8);
    }

    #[test]
    fn test_invalid_values() {
        assert!(ServerConfig::from_lookup(lookup_from(&[(ENV_MAX_IDLE_SECS, "soon")])).is_err());
        assert!(ServerConfig::from_lookup(lookup_from(&[(ENV_SWEEP_INTERVAL_SECS, "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup_from(&[(ENV_LISTEN_ADDR, "nowhere")])).is_err());
    }
}
