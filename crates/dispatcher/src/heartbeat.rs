use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskgate_core::config::HeartbeatConfig;
use taskgate_core::{CircuitState, Clock, ProcessHeartbeat, QueueRepositories};
use taskgate_errors::QueueResult;
use taskgate_infrastructure::{MemoryLeakDetector, ResourceMonitor};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::stats::{EngineCounters, GroupGauges};

/// 写入单条心跳所需的状态
pub struct HeartbeatWriter {
    session_id: String,
    repositories: QueueRepositories,
    clock: Arc<dyn Clock>,
    counters: Arc<EngineCounters>,
    gauges: Vec<Arc<GroupGauges>>,
    monitor: Arc<ResourceMonitor>,
    detector: Mutex<MemoryLeakDetector>,
}

impl HeartbeatWriter {
    pub fn new(
        session_id: String,
        repositories: QueueRepositories,
        clock: Arc<dyn Clock>,
        counters: Arc<EngineCounters>,
        gauges: Vec<Arc<GroupGauges>>,
        monitor: Arc<ResourceMonitor>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            session_id,
            repositories,
            clock,
            counters,
            gauges,
            monitor,
            detector: Mutex::new(MemoryLeakDetector::new(
                config.memory_leak_threshold_mb,
                config.memory_leak_samples,
            )),
        }
    }

    /// 写入一条心跳并刷新会话活动时间
    pub async fn beat_once(&self) -> QueueResult<ProcessHeartbeat> {
        let sample = self.monitor.sample();
        let leak_detected = self
            .detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(sample.used_mb);

        let heartbeat = ProcessHeartbeat {
            process_id: std::process::id(),
            session_id: self.session_id.clone(),
            timestamp: self.clock.now(),
            memory_used_mb: sample.used_mb,
            memory_total_mb: sample.total_mb,
            uptime_seconds: self.monitor.uptime_seconds(),
            tasks_processed: self.counters.tasks_processed(),
            tasks_failed: self.counters.tasks_failed(),
            consecutive_failures: self.counters.consecutive_failures(),
            memory_leak_detected: leak_detected,
            gc_triggered: false,
            circuit_breaker_open: self
                .gauges
                .iter()
                .any(|gauges| gauges.circuit_state() == CircuitState::Open),
        };

        self.repositories.heartbeats.record(&heartbeat).await?;
        self.repositories
            .sessions
            .touch(
                &self.session_id,
                heartbeat.timestamp,
                self.counters.session_counters(),
            )
            .await?;

        debug!(
            "心跳: 内存 {:.1}/{:.1}MB, 已处理 {}, 失败 {}, 连续失败 {}",
            heartbeat.memory_used_mb,
            heartbeat.memory_total_mb,
            heartbeat.tasks_processed,
            heartbeat.tasks_failed,
            heartbeat.consecutive_failures
        );
        Ok(heartbeat)
    }
}

/// 周期性心跳服务
pub struct HeartbeatService {
    writer: Arc<HeartbeatWriter>,
    interval: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    pub fn new(writer: Arc<HeartbeatWriter>, config: &HeartbeatConfig) -> Self {
        Self {
            writer,
            interval: Duration::from_secs(config.interval_seconds.max(1)),
            shutdown_tx: None,
            heartbeat_handle: None,
        }
    }

    pub fn writer(&self) -> &Arc<HeartbeatWriter> {
        &self.writer
    }

    pub fn start(&mut self) {
        if self.heartbeat_handle.is_some() {
            return;
        }
        info!("启动心跳服务, 间隔 {:?}", self.interval);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let writer = self.writer.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = writer.beat_once().await {
                            warn!("写入心跳失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("心跳服务收到停止信号");
                        break;
                    }
                }
            }
        });

        self.heartbeat_handle = Some(handle);
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.heartbeat_handle.take() {
            if let Err(e) = handle.await {
                warn!("等待心跳服务停止时出错: {}", e);
            }
            info!("心跳服务已停止");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_core::{ManualClock, ResourceGroup, SessionCounters};
    use taskgate_testing_utils::{InMemoryStore, SessionBuilder};

    async fn writer(store: &InMemoryStore, clock: &ManualClock) -> (HeartbeatWriter, Vec<Arc<GroupGauges>>) {
        store
            .repositories()
            .sessions
            .create(&SessionBuilder::new("hb").last_active_at(clock.now()).build())
            .await
            .unwrap();
        let gauges: Vec<_> = ResourceGroup::ALL.into_iter().map(GroupGauges::new).collect();
        let writer = HeartbeatWriter::new(
            "hb".to_string(),
            store.repositories(),
            Arc::new(clock.clone()),
            EngineCounters::new(),
            gauges.clone(),
            Arc::new(ResourceMonitor::new()),
            &HeartbeatConfig::default(),
        );
        (writer, gauges)
    }

    #[tokio::test]
    async fn test_beat_once_writes_row_and_touches_session() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let (writer, _) = writer(&store, &clock).await;

        clock.advance(Duration::from_secs(30));
        let heartbeat = writer.beat_once().await.unwrap();

        assert_eq!(heartbeat.process_id, std::process::id());
        assert!(!heartbeat.gc_triggered);
        assert!(!heartbeat.circuit_breaker_open);
        assert_eq!(store.heartbeats().len(), 1);

        let session = store.repositories().sessions.get("hb").await.unwrap().unwrap();
        assert_eq!(session.last_activity, clock.now());
    }

    #[tokio::test]
    async fn test_reports_open_breaker() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let (writer, gauges) = writer(&store, &clock).await;

        gauges[1].publish(0, 0, 0, CircuitState::Open);
        let heartbeat = writer.beat_once().await.unwrap();
        assert!(heartbeat.circuit_breaker_open);
    }

    #[tokio::test]
    async fn test_counters_flow_into_heartbeat() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let (writer, _) = writer(&store, &clock).await;

        writer.counters.record_submitted();
        writer.counters.record_attempt_failure();
        writer.counters.record_terminal(false);
        let heartbeat = writer.beat_once().await.unwrap();

        assert_eq!(heartbeat.tasks_processed, 1);
        assert_eq!(heartbeat.tasks_failed, 1);
        assert_eq!(heartbeat.consecutive_failures, 1);
        let session = store.repositories().sessions.get("hb").await.unwrap().unwrap();
        assert_eq!(
            SessionCounters {
                total_tasks: session.total_tasks,
                completed_tasks: session.completed_tasks,
                failed_tasks: session.failed_tasks,
            },
            SessionCounters {
                total_tasks: 1,
                completed_tasks: 0,
                failed_tasks: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_service_start_stop() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let (writer, _) = writer(&store, &clock).await;

        let mut service = HeartbeatService::new(Arc::new(writer), &HeartbeatConfig::default());
        service.start();
        // 第一次 tick 立即触发
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop().await;

        assert_eq!(store.heartbeats().len(), 1);
    }
}
