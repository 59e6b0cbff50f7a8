//! 死信诊断
//!
//! 格式错误、非法状态流转等无法通过重投修复的记录会被跳过并提交 offset，
//! 同时向死信 topic 写一条诊断消息，保留原始负载和失败原因，便于人工排查。
//! 诊断发布是尽力而为的，失败只记日志，不阻塞提交。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::events::headers;
use crate::kafka::{ConsumerMessage, topics};
use crate::observability::metrics as order_metrics;
use crate::publisher::{EventPublisher, OutboundRecord};

/// 死信消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始事件 ID；信封无法解析时为 "{topic}:{partition}:{offset}"
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub consumer_group: String,
    /// 失败原因错误码，见 [`OrderError::code`]
    pub reason_code: String,
    pub error: String,
    /// 原始负载，非 UTF-8 字节按替换字符输出
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn new(msg: &ConsumerMessage, consumer_group: &str, err: &OrderError) -> Self {
        let message_id = msg
            .header(headers::EVENT_ID)
            .map(String::from)
            .unwrap_or_else(|| format!("{}:{}:{}", msg.topic, msg.partition, msg.offset));

        Self {
            message_id,
            source_topic: msg.topic.clone(),
            source_partition: msg.partition,
            source_offset: msg.offset,
            consumer_group: consumer_group.to_string(),
            reason_code: err.code().to_string(),
            error: err.to_string(),
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            failed_at: Utc::now(),
        }
    }

    /// 转为死信 topic 上的出站记录，key 沿用原记录 key 以便按订单检索
    fn to_record(&self, key: Option<&str>) -> Result<OutboundRecord, OrderError> {
        let payload = serde_json::to_vec(self)?;
        let headers = BTreeMap::from([
            ("dead-letter-reason".to_string(), self.reason_code.clone()),
            (
                "dead-letter-group".to_string(),
                self.consumer_group.clone(),
            ),
        ]);

        Ok(OutboundRecord {
            event_id: Uuid::now_v7(),
            topic: topics::DEAD_LETTER.to_string(),
            key: key.unwrap_or(&self.message_id).to_string(),
            payload,
            headers,
        })
    }
}

/// 死信诊断发布器
#[derive(Clone)]
pub struct DeadLetterPublisher {
    publisher: Arc<dyn EventPublisher>,
    consumer_group: String,
}

impl DeadLetterPublisher {
    pub fn new(publisher: Arc<dyn EventPublisher>, consumer_group: impl Into<String>) -> Self {
        Self {
            publisher,
            consumer_group: consumer_group.into(),
        }
    }

    /// 发布一条诊断，任何失败都只记日志
    pub async fn report(&self, msg: &ConsumerMessage, err: &OrderError) {
        let dead_letter = DeadLetterMessage::new(msg, &self.consumer_group, err);
        order_metrics::record_dead_letter(&self.consumer_group, err.code());

        let record = match dead_letter.to_record(msg.key.as_deref()) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, message_id = %dead_letter.message_id, "死信消息序列化失败");
                return;
            }
        };

        match self.publisher.publish(&record).await {
            Ok(_) => info!(
                message_id = %dead_letter.message_id,
                source_topic = %dead_letter.source_topic,
                source_offset = dead_letter.source_offset,
                reason = %dead_letter.reason_code,
                "已写入死信诊断"
            ),
            Err(e) => warn!(
                error = %e,
                message_id = %dead_letter.message_id,
                "死信诊断发布失败，继续提交 offset"
            ),
        }
    }
}
