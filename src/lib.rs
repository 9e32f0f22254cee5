//! Network quality probing for matchmaking.
//!
//! Discovers the QoS servers of a fleet, measures latency, packet loss and
//! server flow control against each of them over a small UDP protocol, and
//! smooths the results into a per-region quality report.

pub mod config;
pub mod discovery;
pub mod models;
pub mod probe;
pub mod scheduler;
pub mod stats;

pub use config::{ConfigError, QosConfig};
pub use discovery::{DiscoveryClient, DiscoveryError};
pub use models::{Endpoint, FlowControl, FlowControlType, ProbeResult};
pub use probe::{ProbeEngine, ProbeError, ProbeJob};
pub use scheduler::{QosSession, SessionError};
pub use stats::{QosReport, StatsAggregator, WeightedStats};
