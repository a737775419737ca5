use std::sync::Arc;
use std::time::Duration;

use taskgate_core::config::MetricsConfig;
use taskgate_core::{Clock, QueueMetrics, QueueRepositories};
use taskgate_errors::{QueueError, QueueResult};
use taskgate_infrastructure::ResourceMonitor;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 吞吐量统计窗口
const THROUGHPUT_WINDOW_SECONDS: i64 = 60;

/// 指标快照计算与记录
///
/// 指标只从任务行派生，快照追加写入 `queue_metrics`，最近一次结果缓存在内存中。
pub struct MetricsReporter {
    repositories: QueueRepositories,
    clock: Arc<dyn Clock>,
    monitor: Arc<ResourceMonitor>,
    latest: RwLock<Option<QueueMetrics>>,
}

impl MetricsReporter {
    pub fn new(
        repositories: QueueRepositories,
        clock: Arc<dyn Clock>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            repositories,
            clock,
            monitor,
            latest: RwLock::new(None),
        }
    }

    /// 计算会话指标，不写入数据库
    ///
    /// 会话行和任务行都不存在时返回 `SessionNotFound`。
    pub async fn compute(&self, session_id: &str) -> QueueResult<QueueMetrics> {
        let now = self.clock.now();
        let aggregates = self.repositories.tasks.aggregate_by_session(session_id).await?;

        if aggregates.is_empty() && self.repositories.sessions.get(session_id).await?.is_none() {
            return Err(QueueError::session_not_found(session_id));
        }

        let since = now - chrono::Duration::seconds(THROUGHPUT_WINDOW_SECONDS);
        let recent_finished = self
            .repositories
            .tasks
            .count_finished_since(session_id, since)
            .await?;

        let mut metrics = QueueMetrics::from_aggregates(session_id, now, &aggregates, recent_finished);
        metrics.memory_usage_mb = Some(self.monitor.sample().used_mb);
        Ok(metrics)
    }

    /// 计算并持久化一次快照
    pub async fn snapshot_now(&self, session_id: &str) -> QueueResult<QueueMetrics> {
        let metrics = self.compute(session_id).await?;
        self.repositories.metrics.insert_snapshot(&metrics).await?;

        debug!(
            "指标快照: 会话 {} 共 {} 个任务, 成功率 {:.2}, 吞吐 {}/分钟",
            session_id, metrics.total_tasks, metrics.success_rate, metrics.throughput_per_minute
        );

        *self.latest.write().await = Some(metrics.clone());
        Ok(metrics)
    }

    pub async fn latest(&self) -> Option<QueueMetrics> {
        self.latest.read().await.clone()
    }
}

/// 周期性指标快照服务，停止时写入最后一次快照
pub struct MetricsService {
    reporter: Arc<MetricsReporter>,
    session_id: String,
    interval: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    reporter_handle: Option<JoinHandle<()>>,
}

impl MetricsService {
    pub fn new(reporter: Arc<MetricsReporter>, session_id: String, config: &MetricsConfig) -> Self {
        Self {
            reporter,
            session_id,
            interval: Duration::from_secs(config.snapshot_interval_seconds.max(1)),
            shutdown_tx: None,
            reporter_handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.reporter_handle.is_some() {
            return;
        }
        info!("启动指标快照服务, 间隔 {:?}", self.interval);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let reporter = self.reporter.clone();
        let session_id = self.session_id.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，跳过以免在没有任务时写入空快照
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reporter.snapshot_now(&session_id).await {
                            warn!("写入指标快照失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        self.reporter_handle = Some(handle);
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.reporter_handle.take() {
            if let Err(e) = handle.await {
                warn!("等待指标服务停止时出错: {}", e);
            }
            if let Err(e) = self.reporter.snapshot_now(&self.session_id).await {
                warn!("写入最终指标快照失败: {}", e);
            }
            info!("指标快照服务已停止");
        }
    }
}
