pub mod models;
pub mod validation;

use std::path::Path;

use anyhow::{Context, Result};
use ::config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use models::{
    CircuitBreakerSettings, CleanupConfig, DatabaseConfig, GroupLimitsConfig, HeartbeatConfig,
    LoggingConfig, MetricsConfig, QueueConfig, ResourceGroupsConfig, RetryConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

use crate::{QueueError, QueueResult};

pub const ENV_PREFIX: &str = "TASKGATE";
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/taskgate.toml", "taskgate.toml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub resource_groups: ResourceGroupsConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetryConfig,
    pub heartbeat: HeartbeatConfig,
    pub metrics: MetricsConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// 加载配置: 内置默认值 -> TOML 文件 -> `TASKGATE__*` 环境变量
    ///
    /// 显式给出的配置文件必须存在；未给出时依次尝试默认路径，都不存在则只用默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(
            ConfigBuilder::try_from(&AppConfig::default()).context("生成默认配置失败")?,
        );

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .find(|path| Path::new(path).exists())
                {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> QueueResult<()> {
        self.database.validate()?;
        self.queue.validate()?;
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.heartbeat.validate()?;
        self.metrics.validate()?;
        self.cleanup.validate()?;
        self.logging.validate()?;

        // 心跳是判断存活会话的依据，过期时间必须长于心跳间隔
        if self.heartbeat.enabled
            && self.queue.orphan_stale_after_seconds <= self.heartbeat.interval_seconds
        {
            return Err(QueueError::config_error(format!(
                "queue.orphan_stale_after_seconds ({}) 必须大于 heartbeat.interval_seconds ({})",
                self.queue.orphan_stale_after_seconds, self.heartbeat.interval_seconds
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceGroup;
    use std::time::Duration;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.database.url, "sqlite://.taskgate/queue.db");
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.cleanup.task_retention_days, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_from_toml() {
        let toml_str = r#"
[database]
url = "sqlite::memory:"

[resource_groups.network]
max_concurrency = 1
min_delay_ms = 0

[circuit_breaker]
failure_threshold = 2

[logging]
format = "json"
"#;
        let config = AppConfig::from_toml(toml_str).expect("parse config");
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.busy_timeout_ms, 5000);
        assert_eq!(
            config.resource_groups.limits_for(ResourceGroup::Network).max_concurrency,
            1
        );
        assert_eq!(
            config.resource_groups.limits_for(ResourceGroup::Filesystem).min_delay,
            Duration::from_millis(10)
        );
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout_ms, 60_000);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_app_config_toml_roundtrip() {
        let config = AppConfig::default();
        let serialized = config.to_toml().expect("serialize");
        let parsed = AppConfig::from_toml(&serialized).expect("parse");
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_app_config_rejects_invalid_toml_values() {
        let toml_str = r#"
[circuit_breaker]
failure_threshold = 0
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("taskgate.toml");
        std::fs::write(
            &path,
            "[queue]\ndefault_max_retries = 1\n[heartbeat]\nenabled = false\n",
        )
        .expect("write config");

        let config = AppConfig::load(path.to_str()).expect("load config");
        assert_eq!(config.queue.default_max_retries, 1);
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.retry.base_delay_ms, 1000);
    }

    #[test]
    fn test_orphan_window_must_exceed_heartbeat_interval() {
        let mut config = AppConfig::default();
        config.heartbeat.interval_seconds = 30;
        config.queue.orphan_stale_after_seconds = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("orphan_stale_after_seconds"));

        config.queue.orphan_stale_after_seconds = 31;
        assert!(config.validate().is_ok());

        // 心跳关闭时不依赖活动时间判断存活
        config.heartbeat.enabled = false;
        config.queue.orphan_stale_after_seconds = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
