//! Fleet discovery.
//!
//! Resolves a fleet id to the QoS servers of each region over HTTP, with
//! ETag revalidation and TTL caching.

mod cache;
mod client;

pub use cache::*;
pub use client::*;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Discovery error types. All are soft: the caller retries later.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("network error: {0}")]
    Http(String),
    #[error("discovery service returned HTTP {0}")]
    Status(u16),
    #[error("failed to parse server list: {0}")]
    Parse(String),
    #[error("last discovery failed, retrying after {0}")]
    CoolingDown(DateTime<Utc>),
    #[error("discovery call ended before completing")]
    Cancelled,
}
