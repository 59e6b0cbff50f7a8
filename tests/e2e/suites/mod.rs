//! 测试套件

pub mod correlation;
pub mod idempotency;
pub mod order_flow;
pub mod poison_records;
