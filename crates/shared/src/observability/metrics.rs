//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const EVENTS_CONSUMED: &str = "orderflow_events_consumed_total";
pub const DISPATCH_DURATION: &str = "orderflow_dispatch_duration_seconds";
pub const EVENTS_PUBLISHED: &str = "orderflow_events_published_total";
pub const DISPATCH_RETRIES: &str = "orderflow_dispatch_retries_total";
pub const DEAD_LETTERS: &str = "orderflow_dead_letters_total";

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 安装全局 recorder 并在指定端口暴露 `/metrics` 与 `/health`
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_metrics();
    metrics::counter!("orderflow_service_starts_total", "service" => service_name.to_string())
        .increment(1);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

fn describe_metrics() {
    metrics::describe_counter!(EVENTS_CONSUMED, "Records consumed, labeled by dispatch outcome");
    metrics::describe_histogram!(
        DISPATCH_DURATION,
        "Time from decode to commit decision per record in seconds"
    );
    metrics::describe_counter!(EVENTS_PUBLISHED, "Envelopes published from the outbox");
    metrics::describe_counter!(
        DISPATCH_RETRIES,
        "Records rewound for redelivery after a transient failure"
    );
    metrics::describe_counter!(DEAD_LETTERS, "Dead-letter diagnostics emitted");
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }))
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    info!("指标服务监听于 {}", addr);

    let app = router(handle);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("指标服务异常退出: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一条消费记录的分发结果
#[inline]
pub fn record_consumed(worker: &str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!(
        EVENTS_CONSUMED,
        "worker" => worker.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    metrics::histogram!(DISPATCH_DURATION, "worker" => worker.to_string()).record(duration_secs);
}

#[inline]
pub fn record_published(topic: &str) {
    metrics::counter!(EVENTS_PUBLISHED, "topic" => topic.to_string()).increment(1);
}

#[inline]
pub fn record_retry(worker: &str) {
    metrics::counter!(DISPATCH_RETRIES, "worker" => worker.to_string()).increment(1);
}

#[inline]
pub fn record_dead_letter(worker: &str, reason: &'static str) {
    metrics::counter!(
        DEAD_LETTERS,
        "worker" => worker.to_string(),
        "reason" => reason
    )
    .increment(1);
}
