//! Runs a probe on a dedicated blocking worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{ProbeEngine, ProbeError};
use crate::models::{Endpoint, ProbeResult};

/// A scheduled probe run. Poll `is_finished` each tick, then `join`.
pub struct ProbeJob {
    endpoints: Vec<Endpoint>,
    handle: JoinHandle<Result<Vec<ProbeResult>, ProbeError>>,
}

impl ProbeJob {
    /// Start a run. Must be called from within a tokio runtime.
    ///
    /// The endpoints are moved into the worker and handed back by `join`.
    pub fn spawn(
        engine: Arc<ProbeEngine>,
        endpoints: Vec<Endpoint>,
        requests_per_endpoint: u32,
        total_timeout: Duration,
    ) -> Self {
        let worker_endpoints = endpoints.clone();
        let handle = tokio::task::spawn_blocking(move || {
            engine.probe(&worker_endpoints, requests_per_endpoint, total_timeout)
        });
        Self { endpoints, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run and return the probed endpoints with their results.
    pub async fn join(self) -> (Vec<Endpoint>, Result<Vec<ProbeResult>, ProbeError>) {
        let result = match self.handle.await {
            Ok(r) => r,
            Err(e) => Err(ProbeError::Worker(format!("spawn_blocking failed: {}", e))),
        };
        (self.endpoints, result)
    }
}

/// Run a probe on a blocking worker and wait for it.
pub async fn run_probe(
    engine: Arc<ProbeEngine>,
    endpoints: Vec<Endpoint>,
    requests_per_endpoint: u32,
    total_timeout: Duration,
) -> Result<Vec<ProbeResult>, ProbeError> {
    ProbeJob::spawn(engine, endpoints, requests_per_endpoint, total_timeout)
        .join()
        .await
        .1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, UdpSocket};

    #[tokio::test]
    async fn test_run_probe_empty() {
        let engine = Arc::new(ProbeEngine::new("t").unwrap());
        let results = run_probe(engine, Vec::new(), 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_job_polls_to_completion() {
        // Bound but never read: every request is lost
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sink.local_addr().unwrap().port();
        let ep = Endpoint::new(Ipv4Addr::LOCALHOST, port, 3, "sink");

        let engine = Arc::new(ProbeEngine::new("t").unwrap());
        let job = ProbeJob::spawn(engine, vec![ep.clone()], 2, Duration::from_millis(100));

        while !job.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (endpoints, results) = job.join().await;
        let results = results.unwrap();

        assert_eq!(endpoints, vec![ep]);
        assert_eq!(results[0].requests_sent, 2);
        assert_eq!(results[0].packet_loss, 1.0);
    }
}
