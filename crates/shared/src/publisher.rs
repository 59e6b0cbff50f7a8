//! 事件发布与发件箱中继
//!
//! 出站事件先随账本记录一起写入发件箱，再由 [`OutboxRelay`] 按写入顺序发布到日志。
//! 发件箱中保存的是序列化后的字节，重试发布与首次发布完全一致（同一 eventId），
//! 配合生产者幂等与下游账本去重，实现有效一次的可观察副作用。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::events::{EventEnvelope, OrderEvent, headers};
use crate::ledger::{LedgerStore, OutboxEntry};
use crate::observability::metrics as order_metrics;

/// 写入日志后的位置回执
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// 待发布的日志记录
///
/// key 为订单 ID，保证同一订单的事件落到同一分区并按发布顺序被观察到。
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub event_id: Uuid,
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl OutboundRecord {
    /// 由信封构造出站记录，topic 与 key 由已解码事件决定
    pub fn from_envelope(envelope: &EventEnvelope, event: &OrderEvent) -> Result<Self, OrderError> {
        let kind = event.event_type();
        let headers = BTreeMap::from([
            (headers::EVENT_TYPE.to_string(), envelope.event_type.clone()),
            (
                headers::EVENT_VERSION.to_string(),
                envelope.event_version.to_string(),
            ),
            (headers::EVENT_ID.to_string(), envelope.event_id.to_string()),
            (
                headers::CORRELATION_ID.to_string(),
                envelope.correlation_id.to_string(),
            ),
        ]);

        Ok(Self {
            event_id: envelope.event_id,
            topic: kind.topic().to_string(),
            key: event.order_id().to_string(),
            payload: envelope.to_bytes()?,
            headers,
        })
    }
}

/// 日志发布接缝
///
/// 生产实现为 [`crate::kafka::KafkaProducer`]，测试使用内存日志或 mock。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 发布单条记录，返回成功即表示已获得全部副本确认
    async fn publish(&self, record: &OutboundRecord) -> Result<Delivery, OrderError>;
}

/// 发件箱中继
///
/// 每个消费组一个实例，只负责本组账本对应的发件箱。
#[derive(Clone)]
pub struct OutboxRelay {
    ledger: Arc<dyn LedgerStore>,
    publisher: Arc<dyn EventPublisher>,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        publisher: Arc<dyn EventPublisher>,
        batch_size: i64,
    ) -> Self {
        Self {
            ledger,
            publisher,
            batch_size: batch_size.max(1),
        }
    }

    /// 按写入顺序发布所有待发记录，返回本次发布条数
    ///
    /// 某条记录发布失败后，同 key 的后续记录本轮不再尝试，以免同一订单的事件在日志中乱序；
    /// 其他 key 的记录照常发布。存在失败时返回第一个错误。
    pub async fn flush(&self) -> Result<usize, OrderError> {
        let mut published = 0;
        let mut blocked = HashSet::new();
        let mut first_error = None;
        let mut after_id = 0;

        loop {
            let pending = self.ledger.pending_outbox(after_id, self.batch_size).await?;
            let Some(last) = pending.last() else {
                break;
            };
            after_id = last.id;
            let batch_len = pending.len();

            let (count, error) = self.publish_entries(pending, &mut blocked).await?;
            published += count;
            if first_error.is_none() {
                first_error = error;
            }

            if (batch_len as i64) < self.batch_size {
                break;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(published),
        }
    }

    /// 只发布某上游事件产生的记录，以及同 key 下更早写入仍待发的记录
    ///
    /// 其他订单的积压不影响当前事件的提交。
    pub async fn flush_source(&self, source_event_id: Uuid) -> Result<usize, OrderError> {
        let pending = self.ledger.pending_outbox_through(source_event_id).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut blocked = HashSet::new();
        match self.publish_entries(pending, &mut blocked).await? {
            (_, Some(e)) => Err(e),
            (count, None) => Ok(count),
        }
    }

    /// 依次发布，跳过已阻塞的 key；返回成功条数与首个发布错误
    async fn publish_entries(
        &self,
        entries: Vec<OutboxEntry>,
        blocked: &mut HashSet<String>,
    ) -> Result<(usize, Option<OrderError>), OrderError> {
        let mut published = 0;
        let mut first_error = None;

        for entry in entries {
            if blocked.contains(&entry.record.key) {
                continue;
            }

            let delivery = match self.publisher.publish(&entry.record).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        outbox_id = entry.id,
                        event_id = %entry.record.event_id,
                        topic = %entry.record.topic,
                        key = %entry.record.key,
                        error = %e,
                        "发件箱记录发布失败，该 key 后续记录保留待发状态"
                    );
                    blocked.insert(entry.record.key);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
            };

            self.ledger.mark_published(entry.id).await?;
            order_metrics::record_published(&entry.record.topic);
            published += 1;

            debug!(
                outbox_id = entry.id,
                event_id = %entry.record.event_id,
                topic = %entry.record.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                "发件箱记录已发布"
            );
        }

        Ok((published, first_error))
    }
}
