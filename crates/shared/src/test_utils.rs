//! 测试工具模块
//!
//! 提供不依赖 Kafka / PostgreSQL 的内存替身，供单元测试和端到端测试驱动真实的消费引擎：
//!
//! - [`MemoryLog`]：按 key 分区的内存日志，记录各消费组已提交的 offset，可注入发布失败
//! - [`MemoryConsumer`]：从 [`MemoryLog`] 读取的消费者，支持提交与回退
//! - [`MemoryLedger`]：内存账本与发件箱，可注入写入失败

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::engine::LogConsumer;
use crate::error::{OrderError, Result};
use crate::events::{EventEnvelope, OrderCreated, OrderEvent, PaymentScenario};
use crate::kafka::ConsumerMessage;
use crate::ledger::{LedgerStore, LedgerWrite, OutboxEntry};
use crate::publisher::{Delivery, EventPublisher, OutboundRecord};

// ==================== 测试数据 ====================

/// 构造一条合法的 OrderCreated 事件
pub fn order_created(order_id: &str, scenario: Option<PaymentScenario>) -> OrderEvent {
    OrderEvent::OrderCreated(OrderCreated {
        order_id: order_id.to_string(),
        customer_email: format!("{order_id}@example.com"),
        product_type: "book".to_string(),
        country: "DE".to_string(),
        payment_scenario: scenario,
        created_at: Utc::now(),
    })
}

/// 生成唯一的测试订单 ID
pub fn test_order_id() -> String {
    format!("ord-{}", Uuid::now_v7())
}

// ==================== 内存日志 ====================

const DEFAULT_PARTITIONS: i32 = 3;

#[derive(Default)]
struct LogState {
    /// topic -> 分区 -> 记录
    topics: HashMap<String, Vec<Vec<ConsumerMessage>>>,
    /// (group, topic, partition) -> 下一条待消费 offset
    committed: HashMap<(String, String, i32), i64>,
    fail_publishes: u32,
    failing_keys: HashSet<String>,
}

/// 内存分区日志
///
/// 同一 key 的记录总落在同一分区，分区内 offset 单调递增。
#[derive(Clone)]
pub struct MemoryLog {
    partitions: i32,
    state: Arc<Mutex<LogState>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryLog {
    pub fn new(partitions: i32) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(LogState::default())),
            version: Arc::new(version),
        }
    }

    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// 创建订阅指定 topic 的消费者，从该组已提交位置开始读取
    pub fn consumer(&self, group: &str, topics: &[&str]) -> MemoryConsumer {
        MemoryConsumer {
            log: self.clone(),
            group: group.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            positions: HashMap::new(),
            wake: self.version.subscribe(),
        }
    }

    /// 接下来 n 次发布返回瞬时错误
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.lock().fail_publishes = n;
    }

    /// 该 key 的发布持续失败，直到调用 `recover_key`
    pub fn fail_publishes_for_key(&self, key: &str) {
        self.state.lock().failing_keys.insert(key.to_string());
    }

    pub fn recover_key(&self, key: &str) {
        self.state.lock().failing_keys.remove(key);
    }

    fn append(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: &BTreeMap<String, String>,
    ) -> Result<Delivery> {
        let delivery = {
            let mut state = self.state.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(OrderError::Kafka("注入的发布失败".to_string()));
            }
            if state.failing_keys.contains(key) {
                return Err(OrderError::Kafka(format!("注入的发布失败: key={}", key)));
            }

            let partition = self.partition_for(key);
            let partitions = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
            let records = &mut partitions[partition as usize];
            let offset = records.len() as i64;
            records.push(ConsumerMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: Some(key.to_string()),
                payload,
                timestamp: Some(Utc::now().timestamp_millis()),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
            Delivery { partition, offset }
        };

        self.version.send_modify(|v| *v += 1);
        Ok(delivery)
    }

    /// 写入任意字节，用于构造格式错误的记录
    pub async fn publish_raw(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
    ) -> Result<Delivery> {
        self.append(topic, key, payload, &headers)
    }

    /// 按契约发布已有信封（重复投递场景复用同一信封）
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<Delivery> {
        let event = OrderEvent::decode(envelope)?;
        let record = OutboundRecord::from_envelope(envelope, &event)?;
        self.publish(&record).await
    }

    /// 以链路根事件发布，模拟下单入口
    pub async fn publish_event(&self, event: &OrderEvent) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::root(event)?;
        self.publish_envelope(&envelope).await?;
        Ok(envelope)
    }

    /// topic 的全部记录，按分区、offset 排序
    pub fn records(&self, topic: &str) -> Vec<ConsumerMessage> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// topic 中可解析的信封
    pub fn envelopes(&self, topic: &str) -> Vec<EventEnvelope> {
        self.records(topic)
            .iter()
            .filter_map(|m| EventEnvelope::from_slice(&m.payload).ok())
            .collect()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// 某消费组在 topic 上尚未提交的记录数
    pub fn lag(&self, group: &str, topic: &str) -> i64 {
        let state = self.state.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return 0;
        };
        partitions
            .iter()
            .enumerate()
            .map(|(p, records)| {
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), p as i32))
                    .copied()
                    .unwrap_or(0);
                records.len() as i64 - committed
            })
            .sum()
    }
}

#[async_trait]
impl EventPublisher for MemoryLog {
    async fn publish(&self, record: &OutboundRecord) -> Result<Delivery> {
        self.append(
            &record.topic,
            &record.key,
            record.payload.clone(),
            &record.headers,
        )
    }
}

/// 内存日志消费者
pub struct MemoryConsumer {
    log: MemoryLog,
    group: String,
    topics: Vec<String>,
    /// (topic, partition) -> 下一条待读 offset；缺省取已提交位置
    positions: HashMap<(String, i32), i64>,
    wake: watch::Receiver<u64>,
}

impl MemoryConsumer {
    fn next_available(&mut self) -> Option<ConsumerMessage> {
        let state = self.log.state.lock();
        for topic in &self.topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (p, records) in partitions.iter().enumerate() {
                let key = (topic.clone(), p as i32);
                let position = self.positions.get(&key).copied().unwrap_or_else(|| {
                    state
                        .committed
                        .get(&(self.group.clone(), topic.clone(), p as i32))
                        .copied()
                        .unwrap_or(0)
                });
                if let Some(msg) = records.get(position as usize) {
                    let msg = msg.clone();
                    self.positions.insert(key, position + 1);
                    return Some(msg);
                }
            }
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn poll(&mut self) -> Result<ConsumerMessage> {
        loop {
            // 先标记已读版本再扫描，扫描后新到的记录会唤醒 changed()
            self.wake.borrow_and_update();
            if let Some(msg) = self.next_available() {
                return Ok(msg);
            }
            self.wake
                .changed()
                .await
                .map_err(|_| OrderError::Kafka("内存日志已关闭".to_string()))?;
        }
    }

    async fn commit(&mut self, msg: &ConsumerMessage) -> Result<()> {
        self.log.state.lock().committed.insert(
            (self.group.clone(), msg.topic.clone(), msg.partition),
            msg.offset + 1,
        );
        Ok(())
    }

    async fn rewind(&mut self, msg: &ConsumerMessage) -> Result<()> {
        self.positions
            .insert((msg.topic.clone(), msg.partition), msg.offset);
        Ok(())
    }
}

// ==================== 内存账本 ====================

#[derive(Default)]
struct LedgerState {
    processed: HashSet<Uuid>,
    outbox: Vec<(OutboxEntry, bool)>,
    next_id: i64,
    fail_records: u32,
    fail_lookups: u32,
}

/// 内存账本与发件箱
pub struct MemoryLedger {
    consumer_group: String,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// 接下来 n 次 `record` 返回瞬时错误
    pub fn fail_next_records(&self, n: u32) {
        self.state.lock().fail_records = n;
    }

    /// 接下来 n 次 `is_processed` 返回瞬时错误
    pub fn fail_next_lookups(&self, n: u32) {
        self.state.lock().fail_lookups = n;
    }

    pub fn contains(&self, event_id: Uuid) -> bool {
        self.state.lock().processed.contains(&event_id)
    }

    pub fn processed_count(&self) -> usize {
        self.state.lock().processed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .outbox
            .iter()
            .filter(|(_, published)| !published)
            .count()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    async fn is_processed(&self, event_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock();
        if state.fail_lookups > 0 {
            state.fail_lookups -= 1;
            return Err(OrderError::Transient("注入的账本读取失败".to_string()));
        }
        Ok(state.processed.contains(&event_id))
    }

    async fn record(&self, event_id: Uuid, outbound: &[OutboundRecord]) -> Result<LedgerWrite> {
        let mut state = self.state.lock();
        if state.fail_records > 0 {
            state.fail_records -= 1;
            return Err(OrderError::Transient("注入的账本写入失败".to_string()));
        }
        if !state.processed.insert(event_id) {
            return Ok(LedgerWrite::AlreadyRecorded);
        }
        for record in outbound {
            state.next_id += 1;
            let id = state.next_id;
            state.outbox.push((
                OutboxEntry {
                    id,
                    source_event_id: event_id,
                    record: record.clone(),
                },
                false,
            ));
        }
        Ok(LedgerWrite::Recorded)
    }

    async fn pending_outbox(&self, after_id: i64, limit: i64) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .state
            .lock()
            .outbox
            .iter()
            .filter(|(entry, published)| !published && entry.id > after_id)
            .take(limit.max(0) as usize)
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn pending_outbox_through(&self, source_event_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let state = self.state.lock();
        let own: Vec<&OutboxEntry> = state
            .outbox
            .iter()
            .map(|(entry, _)| entry)
            .filter(|entry| entry.source_event_id == source_event_id)
            .collect();
        let Some(last_id) = own.iter().map(|entry| entry.id).max() else {
            return Ok(Vec::new());
        };
        let keys: HashSet<&str> = own.iter().map(|entry| entry.record.key.as_str()).collect();

        Ok(state
            .outbox
            .iter()
            .filter(|(entry, published)| {
                !published && entry.id <= last_id && keys.contains(entry.record.key.as_str())
            })
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn mark_published(&self, outbox_id: i64) -> Result<()> {
        if let Some((_, published)) = self
            .state
            .lock()
            .outbox
            .iter_mut()
            .find(|(entry, _)| entry.id == outbox_id)
        {
            *published = true;
        }
        Ok(())
    }
}
