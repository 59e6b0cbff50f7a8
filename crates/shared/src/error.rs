//! 统一错误处理模块
//!
//! 定义订单事件传播链路中所有共享的错误类型，并给出每种错误对应的
//! 消费处置策略（重试 / 跳过并提交 / 致命），消费引擎据此决定是否提交 offset。

use thiserror::Error;

/// 错误对消费进度的处置方式
///
/// 由数据驱动提交策略：引擎只看处置结果，不依赖捕获特定错误类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 瞬时故障：不提交 offset，退避后由日志重新投递同一条记录
    Retry,
    /// 重新投递也无法修复：提交 offset 继续推进分区
    SkipAndCommit,
    /// 启动配置缺失等进程级错误
    Fatal,
}

/// 系统错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    // ==================== 基础设施错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("基础设施暂不可用: {0}")]
    Transient(String),

    // ==================== 事件契约错误 ====================
    #[error("事件格式错误: event_type={event_type}, {reason}")]
    MalformedEvent { event_type: String, reason: String },

    #[error("未知事件类型: event_type={event_type}, version={version}")]
    UnknownEventType { event_type: String, version: u32 },

    // ==================== 生命周期错误 ====================
    #[error("非法状态流转: order_id={order_id}, from={from}, trigger={trigger}")]
    IllegalTransition {
        order_id: String,
        from: String,
        trigger: String,
    },

    // ==================== 启动配置错误 ====================
    #[error("启动配置错误: {0}")]
    Configuration(String),

    // ==================== 通用错误 ====================
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 构造格式错误，event_type 未知时传空字符串
    pub fn malformed(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Transient(_) => "TRANSIENT_INFRASTRUCTURE",
            Self::MalformedEvent { .. } => "MALFORMED_EVENT",
            Self::UnknownEventType { .. } => "UNKNOWN_EVENT_TYPE",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::Configuration(_) => "STARTUP_CONFIGURATION",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    /// 消费引擎对该错误的处置策略
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Database(e) if is_transient_sqlx(e) => Disposition::Retry,
            Self::Database(_) => Disposition::SkipAndCommit,
            Self::Kafka(_) | Self::Transient(_) => Disposition::Retry,
            Self::Configuration(_) => Disposition::Fatal,
            Self::MalformedEvent { .. }
            | Self::UnknownEventType { .. }
            | Self::IllegalTransition { .. }
            | Self::Serialization(_)
            | Self::Internal(_) => Disposition::SkipAndCommit,
        }
    }

    /// 跳过时是否需要输出诊断（日志告警 + 死信记录）
    ///
    /// 未知事件类型只是"本 worker 不关心"，静默跳过即可。
    pub fn needs_diagnostic(&self) -> bool {
        self.disposition() == Disposition::SkipAndCommit
            && !matches!(self, Self::UnknownEventType { .. })
    }
}

/// 连接、资源与事务冲突类故障可以靠重投恢复；约束违反、解码失败等重投结果不变
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // SQLSTATE 08 连接异常、40 事务回滚、53 资源不足、57 运维干预
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => matches!(code.get(..2), Some("08" | "40" | "53" | "57")),
            None => true,
        },
        _ => false,
    }
}

impl From<config::ConfigError> for OrderError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
