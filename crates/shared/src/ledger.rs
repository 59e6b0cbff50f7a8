//! 幂等账本
//!
//! 每个消费组一张账本表，记录已处理的 eventId；出站记录与账本行在同一事务写入发件箱表。
//! 账本只记录 eventId，与 offset 无关，分区重平衡或 offset 重置后仍能识别重复投递。

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{OrderError, Result};
use crate::publisher::OutboundRecord;

/// 账本写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerWrite {
    /// 首次记录，出站记录已入发件箱
    Recorded,
    /// 并发或重复投递中另一方已先记录，本次写入整体回滚
    AlreadyRecorded,
}

/// 发件箱中一条待发布记录
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    /// 产生该记录的上游事件
    pub source_event_id: Uuid,
    pub record: OutboundRecord,
}

/// 账本存储接缝
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 账本所属消费组
    fn consumer_group(&self) -> &str;

    async fn is_processed(&self, event_id: Uuid) -> Result<bool>;

    /// 原子写入账本行与出站记录
    async fn record(&self, event_id: Uuid, outbound: &[OutboundRecord]) -> Result<LedgerWrite>;

    /// 按写入顺序读取 id 大于 `after_id` 的待发记录
    async fn pending_outbox(&self, after_id: i64, limit: i64) -> Result<Vec<OutboxEntry>>;

    /// 某上游事件的待发记录，连同同 key 下更早写入的待发记录，按写入顺序返回
    async fn pending_outbox_through(&self, source_event_id: Uuid) -> Result<Vec<OutboxEntry>>;

    async fn mark_published(&self, outbox_id: i64) -> Result<()>;
}

/// 将消费组名规整为可用作表名前缀的标识符
///
/// 只保留 `[a-z0-9_]`，其余字符替换为下划线，数字开头时补 `g_`；
/// 结果为空时视为启动配置错误。
pub fn table_prefix(consumer_group: &str) -> Result<String> {
    let mut prefix: String = consumer_group
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    if prefix.trim_matches('_').is_empty() {
        return Err(OrderError::Configuration(format!(
            "消费组名无法生成账本表名: {consumer_group:?}"
        )));
    }
    if prefix.starts_with(|c: char| c.is_ascii_digit()) {
        prefix.insert_str(0, "g_");
    }
    Ok(prefix)
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    source_event_id: Uuid,
    event_id: Uuid,
    topic: String,
    message_key: String,
    payload: Vec<u8>,
    headers: Json<BTreeMap<String, String>>,
}

impl From<OutboxRow> for OutboxEntry {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            source_event_id: row.source_event_id,
            record: OutboundRecord {
                event_id: row.event_id,
                topic: row.topic,
                key: row.message_key,
                payload: row.payload,
                headers: row.headers.0,
            },
        }
    }
}

/// 账本表与发件箱表名
#[derive(Debug, Clone)]
struct LedgerTables {
    processed: String,
    outbox: String,
}

/// PostgreSQL 账本实现
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    consumer_group: String,
    tables: LedgerTables,
}

impl PgLedger {
    pub fn new(pool: PgPool, consumer_group: impl Into<String>) -> Result<Self> {
        let consumer_group = consumer_group.into();
        let prefix = table_prefix(&consumer_group)?;
        Ok(Self {
            pool,
            consumer_group,
            tables: LedgerTables {
                processed: format!("{prefix}_processed_events"),
                outbox: format!("{prefix}_outbox"),
            },
        })
    }

    /// 幂等创建账本表、发件箱表及待发索引
    pub async fn ensure_schema(&self) -> Result<()> {
        let LedgerTables { processed, outbox } = &self.tables;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {processed} (
                event_id UUID PRIMARY KEY,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {outbox} (
                id BIGSERIAL PRIMARY KEY,
                source_event_id UUID NOT NULL,
                event_id UUID NOT NULL UNIQUE,
                topic TEXT NOT NULL,
                message_key TEXT NOT NULL,
                payload BYTEA NOT NULL,
                headers JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                published_at TIMESTAMPTZ
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {outbox}_pending_idx ON {outbox} (id) WHERE published_at IS NULL"
        ))
        .execute(&self.pool)
        .await?;

        info!(
            consumer_group = %self.consumer_group,
            processed_table = %processed,
            outbox_table = %outbox,
            "账本表结构已就绪"
        );
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    async fn is_processed(&self, event_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE event_id = $1)",
            self.tables.processed
        ))
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    #[instrument(skip(self, outbound), fields(consumer_group = %self.consumer_group, outbound = outbound.len()))]
    async fn record(&self, event_id: Uuid, outbound: &[OutboundRecord]) -> Result<LedgerWrite> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (event_id) VALUES ($1) ON CONFLICT (event_id) DO NOTHING",
            self.tables.processed
        ))
        .bind(event_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            debug!(%event_id, "账本已存在该事件，放弃本次写入");
            return Ok(LedgerWrite::AlreadyRecorded);
        }

        let insert_outbox = format!(
            r#"
            INSERT INTO {} (source_event_id, event_id, topic, message_key, payload, headers)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.tables.outbox
        );
        for record in outbound {
            sqlx::query(&insert_outbox)
                .bind(event_id)
                .bind(record.event_id)
                .bind(&record.topic)
                .bind(&record.key)
                .bind(&record.payload)
                .bind(Json(&record.headers))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(LedgerWrite::Recorded)
    }

    async fn pending_outbox(&self, after_id: i64, limit: i64) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT id, source_event_id, event_id, topic, message_key, payload, headers
            FROM {}
            WHERE published_at IS NULL AND id > $1
            ORDER BY id
            LIMIT $2
            "#,
            self.tables.outbox
        ))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OutboxEntry::from).collect())
    }

    async fn pending_outbox_through(&self, source_event_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let outbox = &self.tables.outbox;
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT id, source_event_id, event_id, topic, message_key, payload, headers
            FROM {outbox}
            WHERE published_at IS NULL
              AND message_key IN (SELECT message_key FROM {outbox} WHERE source_event_id = $1)
              AND id <= (SELECT max(id) FROM {outbox} WHERE source_event_id = $1)
            ORDER BY id
            "#
        ))
        .bind(source_event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OutboxEntry::from).collect())
    }

    async fn mark_published(&self, outbox_id: i64) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET published_at = now() WHERE id = $1 AND published_at IS NULL",
            self.tables.outbox
        ))
        .bind(outbox_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
