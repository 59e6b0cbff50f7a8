//! 履约 worker 入口

use std::sync::Arc;

use anyhow::Result;
use fulfillment_worker::{FulfillmentHandler, SERVICE_NAME};
use orderflow_shared::config::AppConfig;
use orderflow_shared::kafka::topics;
use orderflow_shared::{observability, worker};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        consumer_group = %config.kafka.consumer_group,
        lead_time_hours = config.worker.fulfillment_lead_time_hours,
        "Starting fulfillment-worker..."
    );

    let handler =
        FulfillmentHandler::from_lead_time_hours(config.worker.fulfillment_lead_time_hours)?;
    worker::run(&config, Arc::new(handler), &[topics::PAYMENT_AUTHORIZED]).await?;

    info!("fulfillment-worker shutdown complete");
    Ok(())
}
