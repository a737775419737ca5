use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::validation::{ConfigValidator, ValidationUtils};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::models::{cpu_count, ResourceGroup, ResourceGroupLimits, MAX_PRIORITY, MIN_PRIORITY};
use crate::{QueueError, QueueResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `sqlite://path/to/file.db` 或 `sqlite::memory:`
    pub url: String,
    pub max_read_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.taskgate/queue.db".to_string(),
            max_read_connections: 4,
            busy_timeout_ms: 5000,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;
        if !self.url.starts_with("sqlite:") {
            return Err(QueueError::config_error(
                "database.url 必须以 sqlite: 开头",
            ));
        }
        ValidationUtils::validate_positive(
            self.max_read_connections as u64,
            "database.max_read_connections",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 单个任务允许设置的最大重试次数
    pub max_retries_limit: u32,
    pub default_max_retries: u32,
    pub default_priority: u8,
    /// 单次尝试的超时时间，0 表示不限制
    pub task_timeout_ms: u64,
    pub recover_orphaned_sessions: bool,
    /// 活跃会话超过该时间无活动即视为遗留会话
    pub orphan_stale_after_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries_limit: 10,
            default_max_retries: 3,
            default_priority: 5,
            task_timeout_ms: 0,
            recover_orphaned_sessions: true,
            orphan_stale_after_seconds: 300,
        }
    }
}

impl QueueConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_ms > 0).then(|| Duration::from_millis(self.task_timeout_ms))
    }
}

impl ConfigValidator for QueueConfig {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_ordered(
            self.default_max_retries as u64,
            self.max_retries_limit as u64,
            "queue.default_max_retries",
            "queue.max_retries_limit",
        )?;
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.default_priority) {
            return Err(QueueError::config_error(format!(
                "queue.default_priority 必须在 {MIN_PRIORITY}-{MAX_PRIORITY} 之间"
            )));
        }
        ValidationUtils::validate_positive(
            self.orphan_stale_after_seconds,
            "queue.orphan_stale_after_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupLimitsConfig {
    /// 0 表示使用 CPU 核数
    pub max_concurrency: usize,
    pub min_delay_ms: u64,
}

impl GroupLimitsConfig {
    fn from_defaults(group: ResourceGroup) -> Self {
        let limits = group.default_limits();
        Self {
            max_concurrency: limits.max_concurrency,
            min_delay_ms: limits.min_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceGroupsConfig {
    pub filesystem: GroupLimitsConfig,
    pub network: GroupLimitsConfig,
    pub computation: GroupLimitsConfig,
    pub memory_intensive: GroupLimitsConfig,
}

impl Default for ResourceGroupsConfig {
    fn default() -> Self {
        Self {
            filesystem: GroupLimitsConfig::from_defaults(ResourceGroup::Filesystem),
            network: GroupLimitsConfig::from_defaults(ResourceGroup::Network),
            computation: GroupLimitsConfig {
                max_concurrency: 0,
                min_delay_ms: 0,
            },
            memory_intensive: GroupLimitsConfig::from_defaults(ResourceGroup::MemoryIntensive),
        }
    }
}

impl ResourceGroupsConfig {
    fn raw(&self, group: ResourceGroup) -> &GroupLimitsConfig {
        match group {
            ResourceGroup::Filesystem => &self.filesystem,
            ResourceGroup::Network => &self.network,
            ResourceGroup::Computation => &self.computation,
            ResourceGroup::MemoryIntensive => &self.memory_intensive,
        }
    }

    pub fn raw_mut(&mut self, group: ResourceGroup) -> &mut GroupLimitsConfig {
        match group {
            ResourceGroup::Filesystem => &mut self.filesystem,
            ResourceGroup::Network => &mut self.network,
            ResourceGroup::Computation => &mut self.computation,
            ResourceGroup::MemoryIntensive => &mut self.memory_intensive,
        }
    }

    pub fn limits_for(&self, group: ResourceGroup) -> ResourceGroupLimits {
        let raw = self.raw(group);
        let max_concurrency = if raw.max_concurrency == 0 {
            cpu_count()
        } else {
            raw.max_concurrency
        };
        ResourceGroupLimits::new(max_concurrency, Duration::from_millis(raw.min_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub backoff_multiplier: f64,
    pub max_recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout_ms: defaults.recovery_timeout.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            max_recovery_timeout_ms: defaults.max_recovery_timeout.as_millis() as u64,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_recovery_timeout: Duration::from_millis(self.max_recovery_timeout_ms),
        }
    }
}

impl ConfigValidator for CircuitBreakerSettings {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_positive(
            self.failure_threshold as u64,
            "circuit_breaker.failure_threshold",
        )?;
        ValidationUtils::validate_positive(
            self.recovery_timeout_ms,
            "circuit_breaker.recovery_timeout_ms",
        )?;
        ValidationUtils::validate_range(
            self.backoff_multiplier,
            1.0,
            10.0,
            "circuit_breaker.backoff_multiplier",
        )?;
        ValidationUtils::validate_ordered(
            self.recovery_timeout_ms,
            self.max_recovery_timeout_ms,
            "circuit_breaker.recovery_timeout_ms",
            "circuit_breaker.max_recovery_timeout_ms",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 0 表示不加抖动
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_ordered(
            self.base_delay_ms,
            self.max_delay_ms,
            "retry.base_delay_ms",
            "retry.max_delay_ms",
        )?;
        ValidationUtils::validate_range(self.backoff_multiplier, 1.0, 10.0, "retry.backoff_multiplier")?;
        ValidationUtils::validate_range(self.jitter_factor, 0.0, 1.0, "retry.jitter_factor")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub memory_leak_threshold_mb: f64,
    pub memory_leak_samples: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            memory_leak_threshold_mb: 100.0,
            memory_leak_samples: 5,
        }
    }
}

impl ConfigValidator for HeartbeatConfig {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_positive(self.interval_seconds, "heartbeat.interval_seconds")?;
        if self.memory_leak_samples < 2 {
            return Err(QueueError::config_error(
                "heartbeat.memory_leak_samples 至少为 2",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub snapshot_interval_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_interval_seconds: 60,
        }
    }
}

impl ConfigValidator for MetricsConfig {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_positive(
            self.snapshot_interval_seconds,
            "metrics.snapshot_interval_seconds",
        )
    }
}

/// 数据保留策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// 已结束任务的保留天数
    pub task_retention_days: i64,
    pub heartbeat_retention_hours: i64,
    pub metrics_retention_days: i64,
    /// 已结束会话的保留天数
    pub session_retention_days: i64,
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3600,
            task_retention_days: 7,
            heartbeat_retention_hours: 24,
            metrics_retention_days: 7,
            session_retention_days: 30,
            batch_size: 1000,
        }
    }
}

impl ConfigValidator for CleanupConfig {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_positive(self.interval_seconds, "cleanup.interval_seconds")?;
        ValidationUtils::validate_positive(self.batch_size as u64, "cleanup.batch_size")?;
        for (value, name) in [
            (self.task_retention_days, "cleanup.task_retention_days"),
            (self.heartbeat_retention_hours, "cleanup.heartbeat_retention_hours"),
            (self.metrics_retention_days, "cleanup.metrics_retention_days"),
            (self.session_retention_days, "cleanup.session_retention_days"),
        ] {
            if value < 1 {
                return Err(QueueError::config_error(format!("{name} 必须大于 0")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl ConfigValidator for LoggingConfig {
    fn validate(&self) -> QueueResult<()> {
        ValidationUtils::validate_one_of(
            &self.level,
            &["trace", "debug", "info", "warn", "error"],
            "logging.level",
        )?;
        ValidationUtils::validate_one_of(&self.format, &["json", "pretty"], "logging.format")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_group_defaults() {
        let config = ResourceGroupsConfig::default();
        assert_eq!(
            config.limits_for(ResourceGroup::Filesystem),
            ResourceGroupLimits::new(10, Duration::from_millis(10))
        );
        assert_eq!(
            config.limits_for(ResourceGroup::Network),
            ResourceGroupLimits::new(3, Duration::from_millis(100))
        );
        assert_eq!(
            config.limits_for(ResourceGroup::Computation),
            ResourceGroupLimits::new(cpu_count(), Duration::ZERO)
        );
        assert_eq!(
            config.limits_for(ResourceGroup::MemoryIntensive),
            ResourceGroupLimits::new(2, Duration::from_millis(500))
        );
    }

    #[test]
    fn test_circuit_breaker_settings_conversion() {
        let settings = CircuitBreakerSettings::default();
        assert_eq!(settings.failure_threshold, 5);
        assert_eq!(settings.recovery_timeout_ms, 60_000);
        assert_eq!(settings.to_breaker_config(), CircuitBreakerConfig::default());

        let mut invalid = settings.clone();
        invalid.failure_threshold = 0;
        assert!(invalid.validate().is_err());

        let mut inverted = settings;
        inverted.max_recovery_timeout_ms = 1;
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_queue_config_validation() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_timeout(), None);

        let mut invalid = config.clone();
        invalid.default_max_retries = 20;
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.default_priority = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_database_config_validation() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.url = "postgres://localhost/db".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.url = String::new();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_logging_config_validation() {
        let mut config = LoggingConfig::default();
        assert!(config.validate().is_ok());
        config.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
