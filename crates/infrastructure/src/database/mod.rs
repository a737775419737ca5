pub mod mapping;
pub mod migrations;
pub mod sqlite;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use taskgate_core::config::DatabaseConfig;
use taskgate_core::QueueRepositories;
use taskgate_errors::{QueueError, QueueResult};
use tracing::{debug, info};

use self::sqlite::{
    SqliteCircuitBreakerRepository, SqliteHeartbeatRepository, SqliteMetricsRepository,
    SqliteSessionRepository, SqliteTaskRepository,
};

/// 写连接池只有一个连接，所有写操作因此串行执行；读连接池用于指标和状态查询
#[derive(Clone)]
pub struct SqlitePools {
    pub writer: SqlitePool,
    pub reader: SqlitePool,
}

pub struct DatabaseManager {
    pools: SqlitePools,
}

impl DatabaseManager {
    pub async fn connect(config: &DatabaseConfig) -> QueueResult<Self> {
        if is_memory_url(&config.url) {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    QueueError::persistence(format!(
                        "创建数据库目录失败 {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        debug!("Opening SQLite database at: {}", config.url);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options.clone())
            .await?;

        migrations::run_migrations(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.max_read_connections)
            .connect_with(options)
            .await?;

        info!("SQLite 数据库已就绪: {}", config.url);
        Ok(Self {
            pools: SqlitePools { writer, reader },
        })
    }

    /// 内存数据库，读写共用同一个连接
    pub async fn in_memory() -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool).await?;

        Ok(Self {
            pools: SqlitePools {
                writer: pool.clone(),
                reader: pool,
            },
        })
    }

    pub fn pools(&self) -> &SqlitePools {
        &self.pools
    }

    pub fn repositories(&self) -> QueueRepositories {
        QueueRepositories {
            tasks: Arc::new(SqliteTaskRepository::new(self.pools.clone())),
            sessions: Arc::new(SqliteSessionRepository::new(self.pools.clone())),
            metrics: Arc::new(SqliteMetricsRepository::new(self.pools.clone())),
            heartbeats: Arc::new(SqliteHeartbeatRepository::new(self.pools.clone())),
            circuit_breakers: Arc::new(SqliteCircuitBreakerRepository::new(self.pools.clone())),
        }
    }

    pub async fn health_check(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pools.reader).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pools.reader.close().await;
        self.pools.writer.close().await;
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_url_detection() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://file:test?mode=memory"));
        assert!(!is_memory_url("sqlite://.taskgate/queue.db"));
    }

    #[tokio::test]
    async fn test_in_memory_manager_health() {
        let manager = DatabaseManager::in_memory().await.expect("in-memory db");
        assert!(manager.health_check().await.is_ok());
        manager.close().await;
    }
}
