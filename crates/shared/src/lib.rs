//! 共享库
//!
//! 订单事件传播链路中各 worker 共用的事件契约、Kafka 封装、幂等账本、
//! 发件箱中继、消费引擎、生命周期状态机以及配置、错误、可观测性等基础设施。

pub mod config;
pub mod database;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod events;
pub mod kafka;
pub mod ledger;
pub mod lifecycle;
pub mod observability;
pub mod publisher;
pub mod retry;
pub mod test_utils;
pub mod worker;
