//! worker 进程装配
//!
//! 两个 worker 的启动流程一致：连接账本库、建表、创建 Kafka 生产者与消费者、
//! 装配消费引擎，并把 SIGINT / SIGTERM 转成引擎的关闭信号。

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::database::Database;
use crate::engine::{ConsumerEngine, OrderEventHandler};
use crate::error::OrderError;
use crate::kafka::{KafkaConsumer, KafkaProducer};
use crate::ledger::PgLedger;
use crate::retry::{RetryPolicy, retry_with_policy};

/// 连接账本数据库并探测连通性，瞬时故障按启动策略重试
pub async fn connect_database(config: &AppConfig) -> Result<Database, OrderError> {
    retry_with_policy(
        &RetryPolicy::startup(),
        "connect_database",
        OrderError::is_retryable,
        || async {
            let db = Database::connect(&config.database).await?;
            db.health_check().await?;
            Ok(db)
        },
    )
    .await
}

/// 按配置装配并运行 worker，直到收到关闭信号
pub async fn run(
    config: &AppConfig,
    handler: Arc<dyn OrderEventHandler>,
    topics: &[&str],
) -> Result<(), OrderError> {
    let db = connect_database(config).await?;
    let ledger = PgLedger::new(db.pool().clone(), config.kafka.consumer_group.clone())?;
    ledger.ensure_schema().await?;

    let producer = KafkaProducer::new(&config.kafka)?;
    let consumer = KafkaConsumer::new(&config.kafka)?;
    consumer.subscribe(topics)?;

    let mut engine = ConsumerEngine::new(consumer, handler, Arc::new(ledger), Arc::new(producer))
        .with_retry_policy(RetryPolicy::from_worker_config(&config.worker))
        .with_outbox_batch_size(config.worker.outbox_batch_size);
    if config.worker.dead_letter_enabled {
        engine = engine.with_dead_letters();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = engine.run(shutdown_rx).await;
    db.close().await;
    result
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到 Ctrl+C，开始优雅关闭");
        }
        _ = terminate => {
            info!("收到 SIGTERM，开始优雅关闭");
        }
    }
}
