//! PaymentAuthorized 处理器
//!
//! 支付授权后安排履约，预计送达时间 = 安排时间 + 交付周期。

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::info;

use orderflow_shared::engine::OrderEventHandler;
use orderflow_shared::error::OrderError;
use orderflow_shared::events::{EventEnvelope, EventType, FulfillmentScheduled, OrderEvent};
use orderflow_shared::lifecycle::{OrderStatus, Transition, next_status};

pub const SERVICE_NAME: &str = "fulfillment-worker";

/// 默认交付周期 3 天
pub const DEFAULT_LEAD_TIME_HOURS: i64 = 72;

const HANDLED: [EventType; 1] = [EventType::PaymentAuthorized];

pub struct FulfillmentHandler {
    lead_time: Duration,
}

impl Default for FulfillmentHandler {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_LEAD_TIME_HOURS))
    }
}

impl FulfillmentHandler {
    pub fn new(lead_time: Duration) -> Self {
        Self { lead_time }
    }

    /// 由配置的小时数构造，负数或超出时间范围时返回配置错误
    pub fn from_lead_time_hours(hours: i64) -> Result<Self, OrderError> {
        Duration::try_hours(hours)
            .filter(|lead_time| *lead_time >= Duration::zero())
            .map(Self::new)
            .ok_or_else(|| {
                OrderError::Configuration(format!("交付周期超出范围: {hours} 小时"))
            })
    }
}

#[async_trait]
impl OrderEventHandler for FulfillmentHandler {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn handled_types(&self) -> &[EventType] {
        &HANDLED
    }

    async fn handle(
        &self,
        _envelope: &EventEnvelope,
        event: &OrderEvent,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        // 支付失败的订单在这里被拒绝，不会安排履约
        let observed = OrderStatus::observed(event.event_type());
        next_status(Some(observed), Transition::ScheduleFulfillment, event.order_id())?;

        let scheduled_at = Utc::now();
        let eta_utc = scheduled_at
            .checked_add_signed(self.lead_time)
            .ok_or_else(|| {
                OrderError::Internal(format!("预计送达时间溢出: lead_time={}", self.lead_time))
            })?;
        info!(order_id = %event.order_id(), %eta_utc, "已安排履约");

        Ok(vec![OrderEvent::FulfillmentScheduled(FulfillmentScheduled {
            order_id: event.order_id().to_string(),
            eta_utc,
            scheduled_at,
        })])
    }
}
