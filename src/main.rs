use anyhow::Result;
use clap::Parser;
use rideau_sensor_sim::cli::Args;
use rideau_sensor_sim::config::FleetConfig;
use rideau_sensor_sim::fleet::FleetOrchestrator;
use rideau_sensor_sim::ingest::{ConsoleIngestor, Ingestor, MqttIngestor};
use rideau_sensor_sim::worker::WorkerPolicy;
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,rideau_sensor_sim=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            tracing::error!(error=%err, "failed to listen for Ctrl+C");
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error=%err, "SIGTERM handler unavailable"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%err, "failed to listen for Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();
    init_tracing()?;
    let config = FleetConfig::load(&args)?;

    let ingestor: Arc<dyn Ingestor> = if config.dry_run {
        Arc::new(ConsoleIngestor::new())
    } else {
        Arc::new(MqttIngestor::new(config.mqtt.clone()))
    };
    let policy = WorkerPolicy {
        publish_failure: config.publish_failure,
        publish_timeout: config.publish_timeout,
    };
    let orchestrator =
        FleetOrchestrator::new(ingestor, policy).with_shutdown_timeout(config.shutdown_timeout);

    let report = orchestrator.run(config.sensors, shutdown_signal()).await;
    report.log_summary();
    Ok(())
}
