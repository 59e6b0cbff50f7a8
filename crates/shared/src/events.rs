//! 事件信封与主题契约
//!
//! 定义订单生命周期中所有事件的统一信封格式、封闭的事件类型集合、
//! 各事件的负载结构，以及用于廉价过滤的传输层 header 约定。
//! 所有生产者与消费者共享这一契约。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::OrderError;
use crate::kafka::topics;

/// 传输层 header 名称
///
/// 事件类型与关联 ID 在 header 中冗余一份，消费者无需完整反序列化负载
/// 即可按类型过滤。
pub mod headers {
    pub const EVENT_TYPE: &str = "event-type";
    pub const EVENT_VERSION: &str = "event-version";
    pub const EVENT_ID: &str = "event-id";
    pub const CORRELATION_ID: &str = "correlation-id";
}

// ---------------------------------------------------------------------------
// EventType: 事件类型枚举
// ---------------------------------------------------------------------------

/// 事件类型枚举
///
/// 封闭集合：线上可能出现的其他判别值一律按 `UnknownEventType` 处理，
/// 因此信封中的 `event_type` 保留为字符串，由 [`EventEnvelope::kind`] 识别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    OrderCreated,
    PaymentAuthorized,
    PaymentFailed,
    FulfillmentScheduled,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        Self::OrderCreated,
        Self::PaymentAuthorized,
        Self::PaymentFailed,
        Self::FulfillmentScheduled,
    ];

    /// 当前支持的最高负载版本，更高版本视为未知事件
    pub fn current_version(&self) -> u32 {
        match self {
            Self::OrderCreated
            | Self::PaymentAuthorized
            | Self::PaymentFailed
            | Self::FulfillmentScheduled => 1,
        }
    }

    /// 每个事件类型独占一个 topic
    pub fn topic(&self) -> &'static str {
        match self {
            Self::OrderCreated => topics::ORDER_CREATED,
            Self::PaymentAuthorized => topics::PAYMENT_AUTHORIZED,
            Self::PaymentFailed => topics::PAYMENT_FAILED,
            Self::FulfillmentScheduled => topics::FULFILLMENT_SCHEDULED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreated => "OrderCreated",
            Self::PaymentAuthorized => "PaymentAuthorized",
            Self::PaymentFailed => "PaymentFailed",
            Self::FulfillmentScheduled => "FulfillmentScheduled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| OrderError::UnknownEventType {
                event_type: s.to_string(),
                version: 0,
            })
    }
}

// ---------------------------------------------------------------------------
// 事件负载
// ---------------------------------------------------------------------------

/// 下单时携带的支付场景提示，存在时直接决定支付结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentScenario {
    Success,
    Fail,
}

/// 国家代码必须是两位大写字母（ISO 3166-1 alpha-2 形式）
fn validate_country(country: &str) -> Result<(), ValidationError> {
    if country.len() == 2 && country.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(ValidationError::new("country_code"))
    }
}

/// 订单创建（链路根事件，由外部下单入口产生）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    #[validate(length(min = 1))]
    pub order_id: String,
    #[validate(email)]
    pub customer_email: String,
    #[validate(length(min = 1))]
    pub product_type: String,
    #[validate(custom(function = "validate_country"))]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_scenario: Option<PaymentScenario>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorized {
    #[validate(length(min = 1))]
    pub order_id: String,
    #[validate(length(min = 1))]
    pub authorization_id: String,
    pub authorized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    #[validate(length(min = 1))]
    pub order_id: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentScheduled {
    #[validate(length(min = 1))]
    pub order_id: String,
    pub eta_utc: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// OrderEvent: 已解码事件的标签联合
// ---------------------------------------------------------------------------

/// 已解码的订单事件
///
/// 先识别判别值再按变体解析负载，消费侧只对该枚举做 match。
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    PaymentAuthorized(PaymentAuthorized),
    PaymentFailed(PaymentFailed),
    FulfillmentScheduled(FulfillmentScheduled),
}

impl OrderEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::OrderCreated(_) => EventType::OrderCreated,
            Self::PaymentAuthorized(_) => EventType::PaymentAuthorized,
            Self::PaymentFailed(_) => EventType::PaymentFailed,
            Self::FulfillmentScheduled(_) => EventType::FulfillmentScheduled,
        }
    }

    /// 事件主体（订单）的 ID，同时作为分区键
    pub fn order_id(&self) -> &str {
        match self {
            Self::OrderCreated(p) => &p.order_id,
            Self::PaymentAuthorized(p) => &p.order_id,
            Self::PaymentFailed(p) => &p.order_id,
            Self::FulfillmentScheduled(p) => &p.order_id,
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, OrderError> {
        let value = match self {
            Self::OrderCreated(p) => serde_json::to_value(p)?,
            Self::PaymentAuthorized(p) => serde_json::to_value(p)?,
            Self::PaymentFailed(p) => serde_json::to_value(p)?,
            Self::FulfillmentScheduled(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// 从信封解码出强类型事件
    ///
    /// - 判别值不在封闭集合内，或版本高于当前支持版本 -> `UnknownEventType`
    /// - 负载结构或字段校验不通过 -> `MalformedEvent`
    pub fn decode(envelope: &EventEnvelope) -> Result<Self, OrderError> {
        let kind = envelope.kind().ok_or_else(|| OrderError::UnknownEventType {
            event_type: envelope.event_type.clone(),
            version: envelope.event_version,
        })?;

        if envelope.event_version > kind.current_version() {
            return Err(OrderError::UnknownEventType {
                event_type: envelope.event_type.clone(),
                version: envelope.event_version,
            });
        }
        if envelope.event_version == 0 {
            return Err(OrderError::malformed(kind.as_str(), "eventVersion 必须从 1 开始"));
        }

        let event = match kind {
            EventType::OrderCreated => Self::OrderCreated(parse_payload(kind, &envelope.payload)?),
            EventType::PaymentAuthorized => {
                Self::PaymentAuthorized(parse_payload(kind, &envelope.payload)?)
            }
            EventType::PaymentFailed => Self::PaymentFailed(parse_payload(kind, &envelope.payload)?),
            EventType::FulfillmentScheduled => {
                Self::FulfillmentScheduled(parse_payload(kind, &envelope.payload)?)
            }
        };

        let validation = match &event {
            Self::OrderCreated(p) => p.validate(),
            Self::PaymentAuthorized(p) => p.validate(),
            Self::PaymentFailed(p) => p.validate(),
            Self::FulfillmentScheduled(p) => p.validate(),
        };
        validation.map_err(|e| OrderError::malformed(kind.as_str(), e.to_string()))?;

        Ok(event)
    }
}

fn parse_payload<T: DeserializeOwned>(
    kind: EventType,
    payload: &serde_json::Value,
) -> Result<T, OrderError> {
    T::deserialize(payload).map_err(|e| OrderError::malformed(kind.as_str(), e.to_string()))
}

// ---------------------------------------------------------------------------
// EventEnvelope: 通用事件信封
// ---------------------------------------------------------------------------

/// 通用事件信封
///
/// 创建后不可变。`correlation_id` 在链路根部确定后逐跳原样复制，
/// `causation_id` 指向直接触发本事件的上游事件，仅根事件为空。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// 事件唯一标识（UUID v7），也是账本去重键
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// 构建链路根事件，关联 ID 取自身 event_id
    pub fn root(event: &OrderEvent) -> Result<Self, OrderError> {
        let event_id = Uuid::now_v7();
        Self::build(event_id, event_id, None, event)
    }

    /// 由上游信封派生新事件：原样复制关联 ID，因果 ID 指向上游 event_id
    ///
    /// 这是构造非根信封的唯一入口，处理器只返回负载，无法自行指定关联 ID。
    pub fn derive(parent: &EventEnvelope, event: &OrderEvent) -> Result<Self, OrderError> {
        Self::build(
            Uuid::now_v7(),
            parent.correlation_id,
            Some(parent.event_id),
            event,
        )
    }

    fn build(
        event_id: Uuid,
        correlation_id: Uuid,
        causation_id: Option<Uuid>,
        event: &OrderEvent,
    ) -> Result<Self, OrderError> {
        let kind = event.event_type();
        Ok(Self {
            event_id,
            event_type: kind.as_str().to_string(),
            event_version: kind.current_version(),
            occurred_at: Utc::now(),
            correlation_id,
            causation_id,
            payload: event.to_payload()?,
        })
    }

    /// 识别判别值，不在封闭集合内时返回 None
    pub fn kind(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    pub fn is_root(&self) -> bool {
        self.causation_id.is_none()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OrderError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 解析信封字节；结构不合法属于格式错误，重投也无法修复
    pub fn from_slice(bytes: &[u8]) -> Result<Self, OrderError> {
        serde_json::from_slice(bytes)
            .map_err(|e| OrderError::malformed("", format!("信封解析失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
