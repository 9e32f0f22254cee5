//! Scheduler module for driving discovery and probe runs.
//!
//! `QosSession` is polled from a single control task: it starts discovery,
//! hands the endpoints to a probe job on a blocking worker, and folds the
//! results into the stats history once the job completes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ConfigError, QosConfig};
use crate::discovery::{DiscoveryClient, DiscoveryError};
use crate::models::{Endpoint, ProbeResult};
use crate::probe::{ProbeEngine, ProbeError, ProbeJob};
use crate::stats::{apply_backoff, QosReport, StatsAggregator};

/// How often `run_once` polls an active run.
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why a run produced no fresh report.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("discovery returned no servers")]
    NoServers,
    #[error("a run is already in progress")]
    Busy,
}

enum Phase {
    Idle,
    Discovering,
    Probing(ProbeJob),
}

/// Single-threaded driver for the QoS pipeline.
pub struct QosSession {
    config: QosConfig,
    discovery: DiscoveryClient,
    engine: Arc<ProbeEngine>,
    stats: StatsAggregator,
    phase: Phase,
    report: QosReport,
    runs: u64,
}

impl QosSession {
    pub fn new(config: QosConfig) -> Result<Self, ConfigError> {
        let discovery = DiscoveryClient::new(&config.discovery_uri);
        Self::with_discovery(config, discovery)
    }

    pub fn with_discovery(config: QosConfig, discovery: DiscoveryClient) -> Result<Self, ConfigError> {
        config.validate()?;
        let engine = Arc::new(ProbeEngine::new(&config.title)?);
        let stats = StatsAggregator::new(config.history_size, config.current_weight)?;

        Ok(Self {
            config,
            discovery,
            engine,
            stats,
            phase: Phase::Idle,
            report: QosReport::default(),
            runs: 0,
        })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    /// Report from the most recent completed run.
    pub fn report(&self) -> &QosReport {
        &self.report
    }

    /// Begin a run. Overlapping runs are rejected.
    pub fn start_run(&mut self) -> Result<(), SessionError> {
        if !self.is_idle() {
            return Err(SessionError::Busy);
        }
        self.discovery
            .begin(&self.config.fleet_id, self.config.discovery_timeout);
        self.phase = Phase::Discovering;
        Ok(())
    }

    /// Advance the active run. Returns the run's outcome once it finishes.
    pub async fn tick(&mut self) -> Option<Result<QosReport, SessionError>> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => None,
            Phase::Discovering => match self.discovery.poll() {
                None => {
                    self.phase = Phase::Discovering;
                    None
                }
                Some(Err(e)) => Some(Err(e.into())),
                Some(Ok(endpoints)) if endpoints.is_empty() => Some(Err(SessionError::NoServers)),
                Some(Ok(endpoints)) => {
                    tracing::debug!("Scheduler: probing {} endpoints", endpoints.len());
                    self.phase = Phase::Probing(ProbeJob::spawn(
                        self.engine.clone(),
                        endpoints,
                        self.config.requests_per_endpoint,
                        self.config.probe_timeout,
                    ));
                    None
                }
            },
            Phase::Probing(job) if !job.is_finished() => {
                self.phase = Phase::Probing(job);
                None
            }
            Phase::Probing(job) => {
                let (endpoints, results) = job.join().await;
                Some(self.finish_run(endpoints, results))
            }
        }
    }

    /// Start a run and poll it to completion.
    pub async fn run_once(&mut self) -> Result<QosReport, SessionError> {
        self.start_run()?;
        loop {
            if let Some(outcome) = self.tick().await {
                return outcome;
            }
            tokio::time::sleep(SESSION_POLL_INTERVAL).await;
        }
    }

    fn finish_run(
        &mut self,
        mut endpoints: Vec<Endpoint>,
        results: Result<Vec<ProbeResult>, ProbeError>,
    ) -> Result<QosReport, SessionError> {
        self.runs += 1;

        let (results, failure) = match results {
            Ok(results) => (results, None),
            Err(e) => {
                tracing::error!("Scheduler: probe run {} aborted: {}", self.runs, e);
                (vec![ProbeResult::default(); endpoints.len()], Some(e))
            }
        };

        let now = Utc::now();
        // Duplicated discovery entries share one result; record it once
        let mut recorded = HashSet::with_capacity(endpoints.len());
        for (endpoint, result) in endpoints.iter_mut().zip(&results) {
            if !recorded.insert(endpoint.id()) {
                continue;
            }
            self.stats.add_result(&endpoint.key(), result.clone());
            if apply_backoff(endpoint, result, now) {
                if let Some(until) = endpoint.backoff_until {
                    self.discovery.set_backoff(endpoint.id(), until);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e.into());
        }

        self.report = QosReport::build(&endpoints, &self.stats);
        match self.report.best() {
            Some(best) => tracing::info!(
                "Scheduler: run {} complete, {} regions, best {} ({:.1}ms, {:.0}% loss)",
                self.runs,
                self.report.results.len(),
                best.region,
                best.latency_ms,
                best.packet_loss * 100.0
            ),
            None => tracing::info!("Scheduler: run {} complete, no region answered", self.runs),
        }

        Ok(self.report.clone())
    }
}

/// Run the session every `interval` until `stop_rx` fires.
pub async fn run_session_loop(
    mut session: QosSession,
    interval: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                match session.run_once().await {
                    Ok(report) => tracing::info!("QoS report: {}", report.to_json()),
                    Err(e) => tracing::warn!("QoS run failed: {}", e),
                }
            }
        }
    }

    tracing::info!("Scheduler: stopped");
}
