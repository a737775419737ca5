use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use taskgate_core::config::CleanupConfig;
use taskgate_core::{Clock, QueueRepositories};
use taskgate_errors::QueueResult;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// 数据清理服务
///
/// 按保留期限分批删除已结束的任务、旧心跳、旧指标快照和已结束的会话，
/// 防止数据库无限增长。活跃会话和未结束的任务不会被删除。
pub struct CleanupService {
    repositories: QueueRepositories,
    config: CleanupConfig,
    clock: Arc<dyn Clock>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CleanupService {
    pub fn new(repositories: QueueRepositories, config: CleanupConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            repositories,
            config,
            clock,
            shutdown_tx: None,
            cleanup_handle: None,
        }
    }

    /// 启动清理服务
    pub async fn start(&mut self) -> QueueResult<()> {
        if !self.config.enabled {
            info!("Cleanup service is disabled");
            return Ok(());
        }
        if self.cleanup_handle.is_some() {
            return Ok(());
        }

        info!("Starting cleanup service with config: {:?}", self.config);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let repositories = self.repositories.clone();
        let config = self.config.clone();
        let clock = self.clock.clone();

        let handle = tokio::spawn(async move {
            let mut cleanup_interval =
                interval(std::time::Duration::from_secs(config.interval_seconds));

            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        if let Err(e) = Self::perform_cleanup(&repositories, &config, clock.now()).await {
                            error!("Cleanup failed: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Cleanup service shutdown requested");
                        break;
                    }
                }
            }
        });

        self.cleanup_handle = Some(handle);
        Ok(())
    }

    /// 停止清理服务
    pub async fn stop(&mut self) -> QueueResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(handle) = self.cleanup_handle.take() {
            if let Err(e) = handle.await {
                warn!("Error waiting for cleanup service to stop: {}", e);
            }
            info!("Cleanup service stopped");
        }
        Ok(())
    }

    /// 立即执行一次清理，不受 enabled 开关影响
    pub async fn cleanup_once(&self) -> QueueResult<CleanupStats> {
        Self::perform_cleanup(&self.repositories, &self.config, self.clock.now()).await
    }

    async fn perform_cleanup(
        repositories: &QueueRepositories,
        config: &CleanupConfig,
        now: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        let start_time = Instant::now();
        let mut stats = CleanupStats::default();
        let batch_size = config.batch_size.max(1);

        debug!("Starting cleanup operation");

        let task_cutoff = now - Duration::days(config.task_retention_days);
        stats.tasks_cleaned = Self::purge_in_batches(batch_size, |limit| {
            repositories.tasks.purge_finished_before(task_cutoff, limit)
        })
        .await?;

        let heartbeat_cutoff = now - Duration::hours(config.heartbeat_retention_hours);
        stats.heartbeats_cleaned = Self::purge_in_batches(batch_size, |limit| {
            repositories.heartbeats.purge_before(heartbeat_cutoff, limit)
        })
        .await?;

        let metrics_cutoff = now - Duration::days(config.metrics_retention_days);
        stats.metrics_cleaned = Self::purge_in_batches(batch_size, |limit| {
            repositories.metrics.purge_before(metrics_cutoff, limit)
        })
        .await?;

        let session_cutoff = now - Duration::days(config.session_retention_days);
        stats.sessions_cleaned = Self::purge_in_batches(batch_size, |limit| {
            repositories.sessions.purge_ended_before(session_cutoff, limit)
        })
        .await?;

        stats.duration = start_time.elapsed();
        stats.total_cleaned = stats.tasks_cleaned
            + stats.heartbeats_cleaned
            + stats.metrics_cleaned
            + stats.sessions_cleaned;

        if stats.has_cleanup() {
            info!(
                "Cleanup completed: {} records cleaned in {:?} (tasks: {}, heartbeats: {}, metrics: {}, sessions: {})",
                stats.total_cleaned,
                stats.duration,
                stats.tasks_cleaned,
                stats.heartbeats_cleaned,
                stats.metrics_cleaned,
                stats.sessions_cleaned
            );
        }

        Ok(stats)
    }

    /// 反复删除直到某一批不满
    async fn purge_in_batches<F, Fut>(batch_size: usize, mut purge: F) -> QueueResult<u64>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = QueueResult<u64>>,
    {
        let mut total = 0;
        loop {
            let cleaned = purge(batch_size).await?;
            total += cleaned;
            if cleaned < batch_size as u64 {
                break;
            }
        }
        Ok(total)
    }
}

/// 清理统计信息
#[derive(Debug, Default, Clone)]
pub struct CleanupStats {
    pub tasks_cleaned: u64,
    pub heartbeats_cleaned: u64,
    pub metrics_cleaned: u64,
    pub sessions_cleaned: u64,
    pub total_cleaned: u64,
    pub duration: std::time::Duration,
}

impl CleanupStats {
    pub fn has_cleanup(&self) -> bool {
        self.total_cleaned > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_stats_default() {
        let stats = CleanupStats::default();
        assert_eq!(stats.total_cleaned, 0);
        assert!(!stats.has_cleanup());
    }

    #[tokio::test]
    async fn test_purge_in_batches_stops_on_short_batch() {
        let mut remaining = 25u64;
        let mut calls = 0;
        let total = CleanupService::purge_in_batches(10, |limit| {
            calls += 1;
            let take = remaining.min(limit as u64);
            remaining -= take;
            async move { Ok(take) }
        })
        .await
        .unwrap();

        assert_eq!(total, 25);
        assert_eq!(calls, 3);
    }
}
