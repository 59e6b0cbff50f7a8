//! OrderCreated 处理器
//!
//! 对新订单做支付决策，发出 PaymentAuthorized 或 PaymentFailed（二者互斥）。

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use orderflow_shared::engine::OrderEventHandler;
use orderflow_shared::error::OrderError;
use orderflow_shared::events::{EventEnvelope, EventType, OrderEvent, PaymentAuthorized, PaymentFailed};
use orderflow_shared::lifecycle::{OrderStatus, Transition, next_status};

use crate::decision::{PaymentDecider, PaymentDecision};

pub const SERVICE_NAME: &str = "payment-worker";

const HANDLED: [EventType; 1] = [EventType::OrderCreated];

pub struct PaymentHandler {
    decider: PaymentDecider,
}

impl PaymentHandler {
    pub fn new(decider: PaymentDecider) -> Self {
        Self { decider }
    }
}

#[async_trait]
impl OrderEventHandler for PaymentHandler {
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
        let observed = OrderStatus::observed(event.event_type());
        let OrderEvent::OrderCreated(order) = event else {
            return Err(OrderError::IllegalTransition {
                order_id: event.order_id().to_string(),
                from: observed.as_str().to_string(),
                trigger: Transition::AuthorizePayment.as_str().to_string(),
            });
        };

        let decision = self.decider.decide(order);
        let transition = match decision {
            PaymentDecision::Authorized { .. } => Transition::AuthorizePayment,
            PaymentDecision::Declined { .. } => Transition::FailPayment,
        };
        next_status(Some(observed), transition, &order.order_id)?;

        let now = Utc::now();
        let emitted = match decision {
            PaymentDecision::Authorized { authorization_id } => {
                info!(order_id = %order.order_id, %authorization_id, "支付已授权");
                OrderEvent::PaymentAuthorized(PaymentAuthorized {
                    order_id: order.order_id.clone(),
                    authorization_id,
                    authorized_at: now,
                })
            }
            PaymentDecision::Declined { reason } => {
                info!(order_id = %order.order_id, %reason, "支付被拒绝");
                OrderEvent::PaymentFailed(PaymentFailed {
                    order_id: order.order_id.clone(),
                    reason,
                    failed_at: now,
                })
            }
        };

        Ok(vec![emitted])
    }
}
