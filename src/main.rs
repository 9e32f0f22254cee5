//! qos-probe - periodic QoS measurement daemon.
//!
//! Probes every region of a fleet on a fixed interval and logs the ranked
//! quality report.

use qos_probe::scheduler::run_session_loop;
use qos_probe::{QosConfig, QosSession};

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("qos_probe=info".parse()?))
        .init();

    // Load configuration
    let cfg = QosConfig::load();
    cfg.validate()?;
    tracing::info!("Starting qos-probe for fleet {}...", cfg.fleet_id);
    tracing::info!(
        "Probing with {} requests per endpoint, {}ms budget, every {}s",
        cfg.requests_per_endpoint,
        cfg.probe_timeout.as_millis(),
        cfg.interval.as_secs_f64()
    );

    let interval = cfg.interval;
    let session = QosSession::new(cfg)?;

    let (stop_tx, stop_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
        }
        let _ = stop_tx.send(());
    });

    run_session_loop(session, interval, stop_rx).await;

    Ok(())
}
