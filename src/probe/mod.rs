//! UDP QoS probing.
//!
//! The packet codec, the blocking probe engine and the job wrapper that runs
//! it on a dedicated worker.

mod engine;
mod job;
pub mod packet;

pub use engine::*;
pub use job::*;

use thiserror::Error;

use crate::config::ConfigError;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("probe worker failed: {0}")]
    Worker(String),
}
