//! Configuration for the QoS pipeline.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::probe::packet::MAX_TITLE_LEN;

pub const MAX_REQUESTS_PER_ENDPOINT: u32 = 256;

/// Rejected settings. A run must not be scheduled with any of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("title is {0} bytes, at most {max} fit in a packet", max = MAX_TITLE_LEN)]
    TitleTooLong(usize),
    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("requests per endpoint must be in 1..={max}, got {0}", max = MAX_REQUESTS_PER_ENDPOINT)]
    RequestCount(u32),
    #[error("history size must be greater than zero")]
    ZeroHistorySize,
    #[error("current weight must be in [0, 1], got {0}")]
    WeightOutOfRange(f32),
    #[error("discovery URI must not be empty")]
    EmptyDiscoveryUri,
    #[error("fleet id must not be empty")]
    EmptyFleetId,
    #[error("run interval must be greater than zero")]
    ZeroInterval,
}

/// Settings for one QoS session.
#[derive(Debug, Clone)]
pub struct QosConfig {
    /// URI pattern with a `{fleet_id}` placeholder.
    pub discovery_uri: String,
    pub fleet_id: String,
    /// Title bytes sent in every request packet.
    pub title: String,
    pub requests_per_endpoint: u32,
    /// Budget shared by all endpoints in one probe run.
    pub probe_timeout: Duration,
    pub discovery_timeout: Duration,
    pub history_size: usize,
    pub current_weight: f32,
    /// Delay between probe runs in the daemon.
    pub interval: Duration,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            discovery_uri: "https://qos.multiplay.com/v1/fleets/{fleet_id}/servers".to_string(),
            fleet_id: String::new(),
            title: "qos-probe".to_string(),
            requests_per_endpoint: 10,
            probe_timeout: Duration::from_millis(5000),
            discovery_timeout: Duration::from_millis(10_000),
            history_size: 10,
            current_weight: 0.75,
            interval: Duration::from_secs(30),
        }
    }
}

impl QosConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `QOS_DISCOVERY_URI`: discovery URI pattern
    /// - `QOS_FLEET_ID`: fleet to probe (required)
    /// - `QOS_TITLE`: title sent in request packets
    /// - `QOS_REQUESTS_PER_ENDPOINT`: requests per endpoint per run (default: 10)
    /// - `QOS_PROBE_TIMEOUT_MS`: probe run budget (default: 5000)
    /// - `QOS_DISCOVERY_TIMEOUT_MS`: discovery request timeout (default: 10000)
    /// - `QOS_HISTORY_SIZE`: results kept per endpoint (default: 10)
    /// - `QOS_CURRENT_WEIGHT`: weight of the newest result (default: 0.75)
    /// - `QOS_INTERVAL_MS`: delay between runs (default: 30000)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(uri) = env::var("QOS_DISCOVERY_URI") {
            cfg.discovery_uri = uri;
        }
        if let Ok(fleet_id) = env::var("QOS_FLEET_ID") {
            cfg.fleet_id = fleet_id;
        }
        if let Ok(title) = env::var("QOS_TITLE") {
            cfg.title = title;
        }
        if let Some(n) = env_parse("QOS_REQUESTS_PER_ENDPOINT") {
            cfg.requests_per_endpoint = n;
        }
        if let Some(ms) = env_parse("QOS_PROBE_TIMEOUT_MS") {
            cfg.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("QOS_DISCOVERY_TIMEOUT_MS") {
            cfg.discovery_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("QOS_HISTORY_SIZE") {
            cfg.history_size = n;
        }
        if let Some(w) = env_parse("QOS_CURRENT_WEIGHT") {
            cfg.current_weight = w;
        }
        if let Some(ms) = env_parse("QOS_INTERVAL_MS") {
            cfg.interval = Duration::from_millis(ms);
        }

        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_uri.is_empty() {
            return Err(ConfigError::EmptyDiscoveryUri);
        }
        if self.fleet_id.is_empty() {
            return Err(ConfigError::EmptyFleetId);
        }
        if self.discovery_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("discovery"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        validate_probe_settings(&self.title, self.requests_per_endpoint, self.probe_timeout)?;
        validate_stats_settings(self.history_size, self.current_weight)
    }
}

pub fn validate_title(title: &str) -> Result<(), ConfigError> {
    if title.is_empty() {
        return Err(ConfigError::EmptyTitle);
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(ConfigError::TitleTooLong(title.len()));
    }
    Ok(())
}

pub fn validate_probe_settings(
    title: &str,
    requests_per_endpoint: u32,
    timeout: Duration,
) -> Result<(), ConfigError> {
    validate_title(title)?;
    if !(1..=MAX_REQUESTS_PER_ENDPOINT).contains(&requests_per_endpoint) {
        return Err(ConfigError::RequestCount(requests_per_endpoint));
    }
    if timeout.is_zero() {
        return Err(ConfigError::ZeroTimeout("probe"));
    }
    Ok(())
}

pub fn validate_stats_settings(history_size: usize, current_weight: f32) -> Result<(), ConfigError> {
    if history_size == 0 {
        return Err(ConfigError::ZeroHistorySize);
    }
    if !(0.0..=1.0).contains(&current_weight) {
        return Err(ConfigError::WeightOutOfRange(current_weight));
    }
    Ok(())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> QosConfig {
        QosConfig {
            fleet_id: "fleet-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let cfg = QosConfig::default();
        assert_eq!(cfg.requests_per_endpoint, 10);
        assert_eq!(cfg.history_size, 10);
        assert!(cfg.discovery_uri.contains("{fleet_id}"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut cfg = valid();
        cfg.title = String::new();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyTitle));

        let mut cfg = valid();
        cfg.title = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(matches!(cfg.validate(), Err(ConfigError::TitleTooLong(_))));

        let mut cfg = valid();
        cfg.probe_timeout = Duration::ZERO;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroTimeout("probe")));

        let mut cfg = valid();
        cfg.discovery_timeout = Duration::ZERO;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroTimeout("discovery")));

        let mut cfg = valid();
        cfg.history_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroHistorySize));

        let mut cfg = valid();
        cfg.current_weight = 1.5;
        assert_eq!(cfg.validate(), Err(ConfigError::WeightOutOfRange(1.5)));

        let mut cfg = valid();
        cfg.interval = Duration::ZERO;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroInterval));

        let mut cfg = valid();
        cfg.fleet_id = String::new();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyFleetId));
    }

    #[test]
    fn test_request_count_bounds() {
        let timeout = Duration::from_secs(1);
        assert!(validate_probe_settings("t", 1, timeout).is_ok());
        assert!(validate_probe_settings("t", 256, timeout).is_ok());
        assert_eq!(
            validate_probe_settings("t", 0, timeout),
            Err(ConfigError::RequestCount(0))
        );
        assert_eq!(
            validate_probe_settings("t", 257, timeout),
            Err(ConfigError::RequestCount(257))
        );
    }

    #[test]
    fn test_weight_bounds() {
        assert!(validate_stats_settings(1, 0.0).is_ok());
        assert!(validate_stats_settings(1, 1.0).is_ok());
        assert!(validate_stats_settings(1, -0.1).is_err());
        assert!(validate_stats_settings(1, f32::NAN).is_err());
    }
}
