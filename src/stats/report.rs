//! Quality report handed to the matchmaker.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::StatsAggregator;
use crate::models::Endpoint;

/// Smoothed quality of one region's QoS server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QosRegionResult {
    pub location: i64,
    pub region: String,
    pub latency_ms: f32,
    pub packet_loss: f32,
}

/// Region results ranked best first, attachable to a ticket's custom
/// properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QosReport {
    pub results: Vec<QosRegionResult>,
}

impl QosReport {
    /// Collect weighted averages for `endpoints`. Endpoints without any
    /// valid measurement are left out.
    pub fn build(endpoints: &[Endpoint], stats: &StatsAggregator) -> Self {
        let mut seen = HashSet::new();
        let mut results: Vec<QosRegionResult> = endpoints
            .iter()
            .filter(|ep| seen.insert(ep.id()))
            .filter_map(|ep| {
                let avg = stats.weighted_average(&ep.key())?;
                Some(QosRegionResult {
                    location: ep.location_id,
                    region: ep.region_id.clone(),
                    latency_ms: avg.latency_ms,
                    packet_loss: avg.packet_loss,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            a.latency_ms
                .total_cmp(&b.latency_ms)
                .then(a.packet_loss.total_cmp(&b.packet_loss))
        });

        Self { results }
    }

    pub fn best(&self) -> Option<&QosRegionResult> {
        self.results.first()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"results\":[]}".to_string())
    }
}
