//! Delivery runtime binary.
//!
//! Reads `EVENTS_*` configuration, starts every component against NATS
//! (or the in-process bus when `EVENTS_SERVERS=memory://`), and shuts down
//! cleanly on Ctrl-C.

use anyhow::{Context, Result};
use delivery_runtime::{connector_for, DeliveryRuntime};
use delivery_telemetry::{init_telemetry, TelemetryConfig};
use dlq_gateway::GatewayConfig;
use event_delivery::DeliveryConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::from_env())
        .context("failed to initialise telemetry")?;

    let config = DeliveryConfig::from_env().context("failed to read delivery configuration")?;
    let gateway = GatewayConfig::from_env().context("failed to read admin API configuration")?;

    let connector = connector_for(&config.bus.servers);
    let runtime = DeliveryRuntime::start(config, gateway, connector).await?;

    info!(admin = %runtime.admin_addr(), "Delivery runtime is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    runtime.shutdown().await;
    Ok(())
}
