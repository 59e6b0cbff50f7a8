//! 幂等消费引擎
//!
//! 每个 worker 运行一个单任务协作式循环：
//!
//! ```text
//! Polling -> Decoding -> Dispatching -> Committing -> Polling
//!                                            |
//!                                         Stopped
//! ```
//!
//! - 只有 Polling 会与关闭信号竞争；已取到的记录一定走完分发和提交。
//! - offset 只在账本与发件箱写入、发件箱发布都成功后提交，或在判定跳过后提交。
//! - 瞬时故障不提交，回退到失败记录由日志重投，引擎按指数退避等待。
//! - 账本按 eventId 去重，重投、重平衡、offset 重置都不会产生第二次副作用。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

use crate::dlq::DeadLetterPublisher;
use crate::error::{Disposition, OrderError};
use crate::events::{EventEnvelope, EventType, OrderEvent, headers};
use crate::kafka::ConsumerMessage;
use crate::ledger::{LedgerStore, LedgerWrite};
use crate::observability::metrics as order_metrics;
use crate::publisher::{EventPublisher, OutboundRecord, OutboxRelay};
use crate::retry::RetryPolicy;

/// 日志消费接缝
///
/// `poll` 必须可安全取消：在返回记录之前被取消不得推进消费位置。
#[async_trait]
pub trait LogConsumer: Send {
    async fn poll(&mut self) -> Result<ConsumerMessage, OrderError>;

    /// 提交该记录之后的位置
    async fn commit(&mut self, msg: &ConsumerMessage) -> Result<(), OrderError>;

    /// 回退到该记录，下一次 `poll` 重新返回它
    async fn rewind(&mut self, msg: &ConsumerMessage) -> Result<(), OrderError>;
}

/// 业务处理器
///
/// 处理器只返回下游事件负载，信封由引擎统一派生，保证关联 ID / 因果 ID 的传递。
#[async_trait]
pub trait OrderEventHandler: Send + Sync {
    /// worker 名称，用于日志与指标标签
    fn name(&self) -> &str;

    /// 本 worker 处理的事件类型，其余类型静默跳过
    fn handled_types(&self) -> &[EventType];

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: &OrderEvent,
    ) -> Result<Vec<OrderEvent>, OrderError>;
}

/// 引擎当前所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Polling,
    Decoding,
    Dispatching,
    Committing,
    Stopped,
}

/// 单条记录的分发结果，决定是否提交 offset
#[derive(Debug)]
pub enum DispatchOutcome {
    /// 首次处理，`emitted` 为发布的下游事件数
    Applied { emitted: usize },
    /// 账本已有该事件，跳过副作用
    Duplicate,
    Skipped(OrderError),
    Retry(OrderError),
    Fatal(OrderError),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Duplicate => "duplicate",
            Self::Skipped(_) => "skipped",
            Self::Retry(_) => "retry",
            Self::Fatal(_) => "fatal",
        }
    }

    /// 该结果是否推进消费位置
    pub fn commits(&self) -> bool {
        matches!(
            self,
            Self::Applied { .. } | Self::Duplicate | Self::Skipped(_)
        )
    }
}

impl From<OrderError> for DispatchOutcome {
    fn from(err: OrderError) -> Self {
        match err.disposition() {
            Disposition::Retry => Self::Retry(err),
            Disposition::SkipAndCommit => Self::Skipped(err),
            Disposition::Fatal => Self::Fatal(err),
        }
    }
}

/// Polling 阶段的竞争结果
enum Polled {
    Shutdown,
    Signal,
    Record(Result<ConsumerMessage, OrderError>),
}

const DEFAULT_OUTBOX_BATCH: i64 = 100;

/// 幂等消费引擎
pub struct ConsumerEngine<C: LogConsumer> {
    worker: String,
    consumer: C,
    handler: Arc<dyn OrderEventHandler>,
    ledger: Arc<dyn LedgerStore>,
    publisher: Arc<dyn EventPublisher>,
    relay: OutboxRelay,
    dead_letters: Option<DeadLetterPublisher>,
    retry_policy: RetryPolicy,
    consecutive_failures: u32,
    state: EngineState,
}

impl<C: LogConsumer> ConsumerEngine<C> {
    pub fn new(
        consumer: C,
        handler: Arc<dyn OrderEventHandler>,
        ledger: Arc<dyn LedgerStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let relay = OutboxRelay::new(ledger.clone(), publisher.clone(), DEFAULT_OUTBOX_BATCH);
        Self {
            worker: handler.name().to_string(),
            consumer,
            handler,
            ledger,
            publisher,
            relay,
            dead_letters: None,
            retry_policy: RetryPolicy::default(),
            consecutive_failures: 0,
            state: EngineState::Polling,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_outbox_batch_size(mut self, batch_size: i64) -> Self {
        self.relay = OutboxRelay::new(self.ledger.clone(), self.publisher.clone(), batch_size);
        self
    }

    /// 启用死信诊断，诊断与业务事件共用同一发布器
    pub fn with_dead_letters(mut self) -> Self {
        self.dead_letters = Some(DeadLetterPublisher::new(
            self.publisher.clone(),
            self.ledger.consumer_group(),
        ));
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// 运行消费循环直到收到关闭信号
    ///
    /// 仅在启动配置错误等致命错误时返回 Err。
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrderError> {
        info!(
            worker = %self.worker,
            consumer_group = %self.ledger.consumer_group(),
            handled = ?self.handler.handled_types(),
            "消费引擎启动"
        );

        match self.relay.flush().await {
            Ok(0) => {}
            Ok(n) => info!(worker = %self.worker, published = n, "已补发上次遗留的发件箱记录"),
            Err(e) => warn!(worker = %self.worker, error = %e, "启动补发发件箱失败，将在后续投递中重试"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state = EngineState::Polling;
            let polled = tokio::select! {
                biased;
                changed = shutdown.changed() => match changed {
                    Ok(()) => Polled::Signal,
                    Err(_) => Polled::Shutdown,
                },
                result = self.consumer.poll() => Polled::Record(result),
            };

            let backoff = match polled {
                Polled::Shutdown => break,
                Polled::Signal => continue,
                Polled::Record(Ok(msg)) => self.process(&msg).await?,
                Polled::Record(Err(e)) => self.poll_failed(e)?,
            };

            if let Some(delay) = backoff {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.state = EngineState::Stopped;
        info!(worker = %self.worker, "消费引擎已停止");
        Ok(())
    }

    /// 处理一条记录并按结果提交或回退
    ///
    /// 返回下次 poll 前应等待的退避时间。
    pub async fn process(&mut self, msg: &ConsumerMessage) -> Result<Option<Duration>, OrderError> {
        let span = info_span!(
            "dispatch",
            worker = %self.worker,
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            event_id = field::Empty,
            event_type = field::Empty,
            correlation_id = field::Empty,
            causation_id = field::Empty,
        );

        async {
            let started = Instant::now();
            let outcome = self.handle_record(msg).await;
            order_metrics::record_consumed(
                &self.worker,
                outcome.label(),
                started.elapsed().as_secs_f64(),
            );

            match outcome {
                DispatchOutcome::Applied { emitted } => {
                    debug!(emitted, "事件处理完成");
                    self.commit(msg).await;
                    Ok(None)
                }
                DispatchOutcome::Duplicate => {
                    info!("重复投递，跳过副作用");
                    self.commit(msg).await;
                    Ok(None)
                }
                DispatchOutcome::Skipped(err) => {
                    if err.needs_diagnostic() {
                        warn!(error = %err, code = err.code(), "记录无法处理，跳过并提交");
                        if let Some(dlq) = &self.dead_letters {
                            dlq.report(msg, &err).await;
                        }
                    } else {
                        debug!(error = %err, "非本 worker 处理的事件，跳过");
                    }
                    self.commit(msg).await;
                    Ok(None)
                }
                DispatchOutcome::Retry(err) => {
                    let delay = self.retry_policy.delay_for_attempt(self.consecutive_failures);
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    order_metrics::record_retry(&self.worker);
                    warn!(
                        error = %err,
                        attempt = self.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "瞬时故障，不提交 offset，退避后重投"
                    );
                    if let Err(e) = self.consumer.rewind(msg).await {
                        error!(error = %e, "回退消费位置失败");
                    }
                    Ok(Some(delay))
                }
                DispatchOutcome::Fatal(err) => {
                    self.state = EngineState::Stopped;
                    error!(error = %err, "致命错误，消费引擎停止");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// 解码并分发一条记录，不涉及提交
    pub async fn handle_record(&mut self, msg: &ConsumerMessage) -> DispatchOutcome {
        self.state = EngineState::Decoding;
        let (envelope, event) = match self.decode(msg) {
            Ok(decoded) => decoded,
            Err(e) => return e.into(),
        };

        let span = Span::current();
        span.record("event_id", field::display(envelope.event_id));
        span.record("event_type", envelope.event_type.as_str());
        span.record("correlation_id", field::display(envelope.correlation_id));
        if let Some(causation_id) = envelope.causation_id {
            span.record("causation_id", field::display(causation_id));
        }

        self.state = EngineState::Dispatching;
        match self.dispatch(&envelope, &event).await {
            Ok(outcome) => outcome,
            Err(e) => e.into(),
        }
    }

    fn handles(&self, kind: EventType) -> bool {
        self.handler.handled_types().contains(&kind)
    }

    /// 先看 header 判别值，不处理的类型不解析负载
    fn decode(&self, msg: &ConsumerMessage) -> Result<(EventEnvelope, OrderEvent), OrderError> {
        let header_type = msg.header(headers::EVENT_TYPE);
        if let Some(raw) = header_type {
            let handled = raw.parse::<EventType>().is_ok_and(|kind| self.handles(kind));
            if !handled {
                return Err(OrderError::UnknownEventType {
                    event_type: raw.to_string(),
                    version: msg
                        .header(headers::EVENT_VERSION)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                });
            }
        }

        let envelope = EventEnvelope::from_slice(&msg.payload)?;

        if let Some(raw) = header_type
            && raw != envelope.event_type
        {
            return Err(OrderError::malformed(
                envelope.event_type.clone(),
                format!("header event-type={raw} 与信封不一致"),
            ));
        }

        match envelope.kind() {
            Some(kind) if self.handles(kind) => {}
            _ => {
                return Err(OrderError::UnknownEventType {
                    event_type: envelope.event_type.clone(),
                    version: envelope.event_version,
                });
            }
        }

        let event = OrderEvent::decode(&envelope)?;
        Ok((envelope, event))
    }

    async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        event: &OrderEvent,
    ) -> Result<DispatchOutcome, OrderError> {
        if self.ledger.is_processed(envelope.event_id).await? {
            // 上次可能在发布前失败，先补发遗留记录再提交
            self.relay.flush_source(envelope.event_id).await?;
            return Ok(DispatchOutcome::Duplicate);
        }

        let produced = self.handler.handle(envelope, event).await?;

        let mut outbound = Vec::with_capacity(produced.len());
        for next in &produced {
            let derived = EventEnvelope::derive(envelope, next)?;
            debug!(
                derived_event_id = %derived.event_id,
                derived_event_type = %derived.event_type,
                "派生下游事件"
            );
            outbound.push(OutboundRecord::from_envelope(&derived, next)?);
        }

        let write = self.ledger.record(envelope.event_id, &outbound).await?;
        // 只补发本订单的积压，其他订单的发布故障不阻塞当前分区
        self.relay.flush_source(envelope.event_id).await?;

        Ok(match write {
            LedgerWrite::Recorded => DispatchOutcome::Applied {
                emitted: outbound.len(),
            },
            LedgerWrite::AlreadyRecorded => DispatchOutcome::Duplicate,
        })
    }

    async fn commit(&mut self, msg: &ConsumerMessage) {
        self.state = EngineState::Committing;
        self.consecutive_failures = 0;
        if let Err(e) = self.consumer.commit(msg).await {
            // 未提交的记录会被重投，由账本吸收
            warn!(error = %e, "提交 offset 失败");
        }
    }

    fn poll_failed(&mut self, err: OrderError) -> Result<Option<Duration>, OrderError> {
        if err.disposition() == Disposition::Fatal {
            self.state = EngineState::Stopped;
            error!(worker = %self.worker, error = %err, "拉取记录遇到致命错误");
            return Err(err);
        }

        let delay = self.retry_policy.delay_for_attempt(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            worker = %self.worker,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "拉取记录失败，退避后重试"
        );
        Ok(Some(delay))
    }
}
