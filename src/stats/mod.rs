//! Result aggregation and reporting.

mod aggregator;
mod report;

pub use aggregator::*;
pub use report::*;
