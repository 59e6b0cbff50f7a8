//! 支付 worker
//!
//! 消费 `orders.order-created`，对每个新订单做出支付决策，
//! 发出 PaymentAuthorized 或 PaymentFailed。

pub mod decision;
pub mod handler;

pub use decision::{PaymentDecider, PaymentDecision};
pub use handler::{PaymentHandler, SERVICE_NAME};
