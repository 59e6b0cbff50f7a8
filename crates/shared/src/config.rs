//! 配置管理模块
//!
//! 分层加载：内置默认值、配置文件、环境变量依次覆盖。
//! 环境变量使用 `ORDERFLOW_` 前缀，嵌套层级以 `__` 分隔，
//! 如 `ORDERFLOW_KAFKA__BROKERS` -> `kafka.brokers`。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::error::{OrderError, Result};

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// 无默认值，缺失时启动失败
    #[serde(default)]
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    /// 生产者投递超时
    pub message_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: String::new(),
            consumer_group: String::new(),
            auto_offset_reset: "earliest".to_string(),
            message_timeout_ms: 5_000,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 无默认值，缺失时启动失败
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_seconds: 30,
            idle_timeout_seconds: 600,
        }
    }
}

/// worker 行为配置
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    /// 单次从发件箱读取的最大条数
    pub outbox_batch_size: i64,
    pub dead_letter_enabled: bool,
    /// 无支付场景提示时的批准比例（0-100）
    pub approval_rate_percent: u8,
    pub fulfillment_lead_time_hours: i64,
}

/// 交付周期上限（5 年）
pub const MAX_FULFILLMENT_LEAD_TIME_HOURS: i64 = 24 * 365 * 5;

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_multiplier: 2.0,
            outbox_batch_size: 100,
            dead_letter_enabled: true,
            approval_rate_percent: 80,
            fulfillment_lead_time_hours: 72,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的覆盖先加载的同名配置项）：
    /// 1. 内置默认值
    /// 2. config/default.toml
    /// 3. config/{ORDERFLOW_ENV}.toml
    /// 4. config/{service_name}.toml
    /// 5. 环境变量（ORDERFLOW_ 前缀）
    pub fn load(service_name: &str) -> Result<Self> {
        // .env 仅用于本地开发，文件不存在时忽略
        let _ = dotenvy::dotenv();

        let env = std::env::var("ORDERFLOW_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let kafka = KafkaConfig::default();
        let database = DatabaseConfig::default();
        let worker = WorkerConfig::default();
        let observability = ObservabilityConfig::default();

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .set_default("kafka.consumer_group", service_name)?
            .set_default("kafka.auto_offset_reset", kafka.auto_offset_reset)?
            .set_default("kafka.message_timeout_ms", kafka.message_timeout_ms)?
            .set_default("database.max_connections", u64::from(database.max_connections))?
            .set_default("database.min_connections", u64::from(database.min_connections))?
            .set_default(
                "database.connect_timeout_seconds",
                database.connect_timeout_seconds,
            )?
            .set_default("database.idle_timeout_seconds", database.idle_timeout_seconds)?
            .set_default("worker.retry_initial_delay_ms", worker.retry_initial_delay_ms)?
            .set_default("worker.retry_max_delay_ms", worker.retry_max_delay_ms)?
            .set_default("worker.retry_multiplier", worker.retry_multiplier)?
            .set_default("worker.outbox_batch_size", worker.outbox_batch_size)?
            .set_default("worker.dead_letter_enabled", worker.dead_letter_enabled)?
            .set_default(
                "worker.approval_rate_percent",
                u64::from(worker.approval_rate_percent),
            )?
            .set_default(
                "worker.fulfillment_lead_time_hours",
                worker.fulfillment_lead_time_hours,
            )?
            .set_default("observability.log_level", observability.log_level)?
            .set_default("observability.log_format", observability.log_format)?
            .set_default("observability.metrics_enabled", observability.metrics_enabled)?
            .set_default(
                "observability.metrics_port",
                u64::from(observability.metrics_port),
            )?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{env}.toml"))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{service_name}.toml")))
                    .required(false),
            )
            // ORDERFLOW_KAFKA__BROKERS -> kafka.brokers
            .add_source(
                Environment::with_prefix("ORDERFLOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验无默认值的必填项及取值范围
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(OrderError::Configuration("kafka.brokers 未配置".to_string()));
        }
        if self.kafka.consumer_group.trim().is_empty() {
            return Err(OrderError::Configuration(
                "kafka.consumer_group 不能为空".to_string(),
            ));
        }
        if self.database.url.trim().is_empty() {
            return Err(OrderError::Configuration("database.url 未配置".to_string()));
        }
        if self.worker.approval_rate_percent > 100 {
            return Err(OrderError::Configuration(format!(
                "worker.approval_rate_percent 超出范围: {}",
                self.worker.approval_rate_percent
            )));
        }
        if self.worker.outbox_batch_size <= 0 {
            return Err(OrderError::Configuration(
                "worker.outbox_batch_size 必须大于 0".to_string(),
            ));
        }
        let lead_time = self.worker.fulfillment_lead_time_hours;
        if !(0..=MAX_FULFILLMENT_LEAD_TIME_HOURS).contains(&lead_time) {
            return Err(OrderError::Configuration(format!(
                "worker.fulfillment_lead_time_hours 超出范围 [0, {MAX_FULFILLMENT_LEAD_TIME_HOURS}]: {lead_time}"
            )));
        }
        Ok(())
    }
}
