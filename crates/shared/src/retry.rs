//! 指数退避
//!
//! 消费引擎用 [`RetryPolicy`] 计算瞬时故障后的重投间隔；进程启动时连接账本库
//! 走 [`retry_with_policy`]，只对调用方判定为可重试的错误重试。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::OrderError;

/// 退避策略
///
/// 第 n 次等待 `initial_delay * multiplier^n`，封顶 `max_delay`。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次执行之外的重试上限，只对 [`retry_with_policy`] 生效
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 启动阶段依赖（数据库）的连接策略：多给几次机会，总等待约半分钟
    pub fn startup() -> Self {
        Self {
            max_retries: 6,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }

    /// 消费重投策略，不设上限，记录一直重投到基础设施恢复
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            multiplier: config.retry_multiplier.max(1.0),
        }
    }

    /// attempt 从 0 开始
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if scaled_ms.is_finite() && scaled_ms < self.max_delay.as_millis() as f64 {
            Duration::from_millis(scaled_ms as u64)
        } else {
            self.max_delay
        }
    }

    /// 已失败 attempt 次后是否还能再试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// 按策略执行异步操作，不可重试的错误立即返回
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&OrderError) -> bool,
    mut operation: F,
) -> Result<T, OrderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrderError>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "重试后成功");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) || !policy.should_retry(attempt) {
            warn!(
                operation = operation_name,
                attempt,
                error = %err,
                "操作失败，不再重试"
            );
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "操作失败，退避后重试"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
