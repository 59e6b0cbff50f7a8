//! 支付 worker 入口

use std::sync::Arc;

use anyhow::Result;
use orderflow_shared::config::AppConfig;
use orderflow_shared::kafka::topics;
use orderflow_shared::{observability, worker};
use payment_worker::{PaymentDecider, PaymentHandler, SERVICE_NAME};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 启动配置缺失直接退出
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        consumer_group = %config.kafka.consumer_group,
        approval_rate_percent = config.worker.approval_rate_percent,
        "Starting payment-worker..."
    );

    let handler = PaymentHandler::new(PaymentDecider::new(config.worker.approval_rate_percent));
    worker::run(&config, Arc::new(handler), &[topics::ORDER_CREATED]).await?;

    info!("payment-worker shutdown complete");
    Ok(())
}
