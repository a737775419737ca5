//! Test helper utilities
//!
//! Config presets with short delays and a throw-away SQLite database.

use std::future::Future;
use std::time::{Duration, Instant};

use taskgate_core::config::{DatabaseConfig, GroupLimitsConfig};
use taskgate_core::AppConfig;
use taskgate_errors::QueueResult;
use taskgate_infrastructure::DatabaseManager;
use tempfile::TempDir;
use tokio::time::sleep;

pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// Configuration tuned for tests: no throttling, fast retries, background
/// services off so assertions are deterministic.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..DatabaseConfig::default()
    };
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 50;
    config.heartbeat.enabled = false;
    config.metrics.enabled = false;
    config.cleanup.enabled = false;
    config.queue.recover_orphaned_sessions = false;
    for group in taskgate_core::ResourceGroup::ALL {
        config.resource_groups.raw_mut(group).min_delay_ms = 0;
    }
    config
}

/// Same as [`test_config`] with explicit limits for one group
pub fn test_config_with_limits(
    group: taskgate_core::ResourceGroup,
    max_concurrency: usize,
    min_delay_ms: u64,
) -> AppConfig {
    let mut config = test_config();
    *config.resource_groups.raw_mut(group) = GroupLimitsConfig {
        max_concurrency,
        min_delay_ms,
    };
    config
}

/// SQLite database in a temporary directory, removed on drop
pub struct TempDatabase {
    pub dir: TempDir,
    pub manager: DatabaseManager,
}

impl TempDatabase {
    pub async fn new() -> QueueResult<Self> {
        let dir = TempDir::new()
            .map_err(|e| taskgate_errors::QueueError::Internal(format!("创建临时目录失败: {e}")))?;
        let config = Self::config_for(&dir);
        let manager = DatabaseManager::connect(&config).await?;
        Ok(Self { dir, manager })
    }

    pub fn config_for(dir: &TempDir) -> DatabaseConfig {
        DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("queue.db").display()),
            ..DatabaseConfig::default()
        }
    }

    pub fn database_config(&self) -> DatabaseConfig {
        Self::config_for(&self.dir)
    }
}
