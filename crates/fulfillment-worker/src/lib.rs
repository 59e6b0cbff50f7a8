//! 履约 worker
//!
//! 只订阅 `orders.payment-authorized`，为已授权支付的订单安排履约并发出 FulfillmentScheduled。

pub mod handler;

pub use handler::{DEFAULT_LEAD_TIME_HOURS, FulfillmentHandler, SERVICE_NAME};
