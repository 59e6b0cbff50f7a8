//! 订单生命周期状态机
//!
//! Created -> {PaymentAuthorized | PaymentFailed} -> FulfillmentScheduled
//!
//! worker 不持久化订单，只根据消费到的事件推断订单"已观察到"的状态，
//! 再由本模块判定触发动作是否合法。`Order` 聚合仅用于按事件折叠出当前视图。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{OrderError, Result};
use crate::events::{EventType, OrderCreated, OrderEvent};

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    PaymentAuthorized,
    PaymentFailed,
    FulfillmentScheduled,
}

impl OrderStatus {
    /// 某类事件被观察到时订单所处的状态
    pub fn observed(kind: EventType) -> Self {
        match kind {
            EventType::OrderCreated => Self::Created,
            EventType::PaymentAuthorized => Self::PaymentAuthorized,
            EventType::PaymentFailed => Self::PaymentFailed,
            EventType::FulfillmentScheduled => Self::FulfillmentScheduled,
        }
    }

    /// 终态之后不允许任何触发
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PaymentFailed | Self::FulfillmentScheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::PaymentAuthorized => "PaymentAuthorized",
            Self::PaymentFailed => "PaymentFailed",
            Self::FulfillmentScheduled => "FulfillmentScheduled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 触发动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Create,
    AuthorizePayment,
    FailPayment,
    ScheduleFulfillment,
}

impl Transition {
    /// 动作成功后发出的事件类型
    pub fn emits(&self) -> EventType {
        match self {
            Self::Create => EventType::OrderCreated,
            Self::AuthorizePayment => EventType::PaymentAuthorized,
            Self::FailPayment => EventType::PaymentFailed,
            Self::ScheduleFulfillment => EventType::FulfillmentScheduled,
        }
    }

    /// 产生该类事件的动作
    pub fn producing(kind: EventType) -> Self {
        match kind {
            EventType::OrderCreated => Self::Create,
            EventType::PaymentAuthorized => Self::AuthorizePayment,
            EventType::PaymentFailed => Self::FailPayment,
            EventType::FulfillmentScheduled => Self::ScheduleFulfillment,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::AuthorizePayment => "AuthorizePayment",
            Self::FailPayment => "FailPayment",
            Self::ScheduleFulfillment => "ScheduleFulfillment",
        }
    }
}

/// 判定状态流转，`current` 为 None 表示链路根部（订单尚不存在）
pub fn next_status(
    current: Option<OrderStatus>,
    transition: Transition,
    order_id: &str,
) -> Result<OrderStatus> {
    use OrderStatus::*;
    use Transition::*;

    match (current, transition) {
        (None, Create) => Ok(Created),
        (Some(Created), AuthorizePayment) => Ok(PaymentAuthorized),
        (Some(Created), FailPayment) => Ok(PaymentFailed),
        (Some(PaymentAuthorized), ScheduleFulfillment) => Ok(FulfillmentScheduled),
        (from, trigger) => Err(OrderError::IllegalTransition {
            order_id: order_id.to_string(),
            from: from.map_or("None", |s| s.as_str()).to_string(),
            trigger: trigger.as_str().to_string(),
        }),
    }
}

/// 订单视图
///
/// 订单记录由下单入口持有；这里只按事件折叠状态，供校验与投影使用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub customer_email: String,
    pub product_type: String,
    pub country: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_created(created: &OrderCreated) -> Self {
        Self {
            id: created.order_id.clone(),
            customer_email: created.customer_email.clone(),
            product_type: created.product_type.clone(),
            country: created.country.clone(),
            status: OrderStatus::Created,
            created_at: created.created_at,
            updated_at: created.created_at,
        }
    }

    /// 应用后续事件；非法流转时订单保持不变
    pub fn apply(&mut self, event: &OrderEvent) -> Result<()> {
        if event.order_id() != self.id {
            return Err(OrderError::Internal(format!(
                "事件订单 {} 与聚合订单 {} 不一致",
                event.order_id(),
                self.id
            )));
        }

        let transition = Transition::producing(event.event_type());
        self.status = next_status(Some(self.status), transition, &self.id)?;
        self.updated_at = match event {
            OrderEvent::OrderCreated(p) => p.created_at,
            OrderEvent::PaymentAuthorized(p) => p.authorized_at,
            OrderEvent::PaymentFailed(p) => p.failed_at,
            OrderEvent::FulfillmentScheduled(p) => p.scheduled_at,
        };
        Ok(())
    }
}
