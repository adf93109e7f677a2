use std::sync::Arc;

use anyhow::{Context, Result};
use collector_worker::config::ServiceConfig;
use collector_worker::influx::InfluxWriter;
use collector_worker::snmp::NetSnmpClient;
use collector_worker::supervisor::{connect_queue, install_signal_handlers, seed_jobs, Supervisor};
use collector_worker::telemetry::{init_telemetry, TelemetryConfig};
use collector_worker::DevicePoller;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    init_telemetry(TelemetryConfig::from_env());
    tracing::info!("collector starting...");

    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        backend = ?config.backend,
        consumer_id = %config.consumer_id,
        threads = config.threads,
        "Loaded configuration"
    );

    let queue = connect_queue(&config).await?;
    if let Some(path) = &config.jobs_file {
        seed_jobs(queue.as_ref(), path).await?;
    }

    let client = NetSnmpClient::new(config.snmp.clone()).context("Failed to create SNMP client")?;
    let writer = InfluxWriter::new(config.influx.clone()).context("Failed to create InfluxDB writer")?;
    let poller = Arc::new(DevicePoller::new(Arc::new(client), Arc::new(writer)));

    let mut supervisor = Supervisor::new(
        queue,
        config.pool_config(),
        poller.into_handler(),
        config.stats_interval,
    );
    install_signal_handlers(supervisor.cancellation_token())
        .context("Failed to install signal handlers")?;

    supervisor.run().await.context("Collector stopped with an error")?;

    tracing::info!("collector shutdown complete");
    Ok(())
}
