//! Per-endpoint result history with a weighted rolling average.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::{validate_stats_settings, ConfigError};
use crate::models::{Endpoint, FlowControlType, ProbeResult};

/// Smoothed quality for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedStats {
    pub latency_ms: f32,
    pub packet_loss: f32,
}

/// Bounded history of recent results, oldest first.
#[derive(Debug, Clone, Default)]
struct StatsHistory {
    results: Vec<ProbeResult>,
    average: Option<WeightedStats>,
}

/// Keeps the last `history_size` results per endpoint key.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    history_size: usize,
    current_weight: f32,
    histories: HashMap<String, StatsHistory>,
}

impl StatsAggregator {
    pub fn new(history_size: usize, current_weight: f32) -> Result<Self, ConfigError> {
        validate_stats_settings(history_size, current_weight)?;
        Ok(Self {
            history_size,
            current_weight,
            histories: HashMap::new(),
        })
    }

    pub fn add_result(&mut self, key: &str, result: ProbeResult) {
        let history = self.histories.entry(key.to_string()).or_default();
        if history.results.len() == self.history_size {
            history.results.remove(0);
        }
        history.results.push(result);
        history.average = weighted_average(&history.results, self.current_weight);
    }

    pub fn weighted_average(&self, key: &str) -> Option<WeightedStats> {
        self.histories.get(key).and_then(|h| h.average)
    }

    /// Stored results for `key`, oldest first.
    pub fn all_results(&self, key: &str) -> Option<&[ProbeResult]> {
        self.histories.get(key).map(|h| h.results.as_slice())
    }
}

/// Weighted mean of the valid results in `results` (oldest first).
///
/// The newest valid result weighs `current_weight` and the rest split the
/// remainder evenly. A lone valid result gets full weight.
pub fn weighted_average(results: &[ProbeResult], current_weight: f32) -> Option<WeightedStats> {
    let valid: Vec<&ProbeResult> = results.iter().filter(|r| r.is_valid()).collect();
    let (latest, older) = valid.split_last()?;

    if older.is_empty() {
        return Some(WeightedStats {
            latency_ms: latest.average_latency_ms as f32,
            packet_loss: latest.packet_loss,
        });
    }

    let current = f64::from(current_weight);
    let other = (1.0 - current) / older.len() as f64;

    let mut latency = current * f64::from(latest.average_latency_ms);
    let mut loss = current * f64::from(latest.packet_loss);
    for r in older {
        latency += other * f64::from(r.average_latency_ms);
        loss += other * f64::from(r.packet_loss);
    }

    Some(WeightedStats {
        latency_ms: latency as f32,
        packet_loss: loss as f32,
    })
}

/// When a result carries flow control, the time before which the endpoint
/// must not be probed again: `2 * units + 0.5` minutes from `now`.
pub fn backoff_until(result: &ProbeResult, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let fc = result.flow_control();
    if fc.kind == FlowControlType::None {
        return None;
    }
    let seconds = i64::from(fc.units) * 120 + 30;
    Some(now + ChronoDuration::seconds(seconds))
}

/// Stamp `endpoint` with the back-off its latest result demands.
pub fn apply_backoff(endpoint: &mut Endpoint, result: &ProbeResult, now: DateTime<Utc>) -> bool {
    match backoff_until(result, now) {
        Some(until) => {
            tracing::warn!(
                "Stats: {} ({}) requested {} x{}, backing off until {}",
                endpoint.key(),
                endpoint.region_id,
                result.flow_control_type,
                result.flow_control_units,
                until.format("%H:%M:%S")
            );
            endpoint.backoff_until = Some(until);
            true
        }
        None => false,
    }
}
