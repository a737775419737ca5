//! 队列引擎
//!
//! 对外的统一入口: 校验并持久化任务，按资源组路由到对应调度器，
//! 提供状态查询、指标查询、会话清理和优雅关闭。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use taskgate_core::config::ConfigValidator;
use taskgate_core::{
    AppConfig, CircuitBreaker, CircuitState, Clock, QueueMetrics, QueueRepositories,
    ResourceGroup, TaskExecutor, TaskOutcome, TaskRequest, TaskSubmitter,
};
use taskgate_errors::{QueueError, QueueResult};
use taskgate_infrastructure::{CleanupService, ResourceMonitor};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::group_scheduler::{
    CompletionSender, GroupScheduler, SchedulerCommand, SchedulerContext,
};
use crate::heartbeat::{HeartbeatService, HeartbeatWriter};
use crate::metrics_reporter::{MetricsReporter, MetricsService};
use crate::retry::RetryPolicy;
use crate::session_manager::SessionManager;
use crate::stats::{EngineCounters, GroupGauges};

/// 已提交任务的句柄
pub struct TaskHandle {
    task_id: String,
    receiver: oneshot::Receiver<QueueResult<TaskOutcome>>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.task_id
    }

    /// 等待任务进入终态
    pub async fn wait(self) -> QueueResult<TaskOutcome> {
        let TaskHandle { task_id, receiver } = self;
        receiver
            .await
            .unwrap_or_else(|_| Err(QueueError::cancelled(task_id)))
    }
}

/// 单个资源组的实时状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub resource_group: ResourceGroup,
    pub queued: usize,
    /// 等待退避结束的重试任务
    pub delayed: usize,
    pub running: usize,
    pub max_concurrency: usize,
    pub circuit_state: CircuitState,
}

/// 队列的即时状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub session_id: String,
    pub accepting: bool,
    pub groups: Vec<GroupStatus>,
    pub per_group_queue_depth: BTreeMap<ResourceGroup, usize>,
    pub running_count: usize,
    /// 有任务在运行的资源组数量
    pub active_workers: usize,
}

struct SchedulerSlot {
    commands: mpsc::Sender<SchedulerCommand>,
    gauges: Arc<GroupGauges>,
    max_concurrency: usize,
}

#[derive(Default)]
struct BackgroundServices {
    heartbeat: Option<HeartbeatService>,
    metrics: Option<MetricsService>,
    cleanup: Option<CleanupService>,
}

struct EngineInner {
    config: AppConfig,
    repositories: QueueRepositories,
    clock: Arc<dyn Clock>,
    session_id: String,
    schedulers: HashMap<ResourceGroup, SchedulerSlot>,
    tasks: Mutex<Vec<(JoinHandle<()>, JoinHandle<()>)>>,
    services: Mutex<BackgroundServices>,
    counters: Arc<EngineCounters>,
    sessions: SessionManager,
    reporter: Arc<MetricsReporter>,
    accepting: AtomicBool,
    shutdown_started: AtomicBool,
}

/// 嵌入式任务队列引擎
#[derive(Clone)]
pub struct QueueEngine {
    inner: Arc<EngineInner>,
}

impl QueueEngine {
    /// 校验配置、打开会话、恢复熔断状态并启动各资源组调度器
    pub async fn start(
        config: AppConfig,
        repositories: QueueRepositories,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        config.validate()?;

        let session_id = Uuid::new_v4().to_string();
        let sessions = SessionManager::new(repositories.clone(), clock.clone(), config.queue.clone())
            .with_heartbeats(config.heartbeat.enabled);
        sessions.open(&session_id).await?;

        let breaker_config = config.circuit_breaker.to_breaker_config();
        let persisted: HashMap<ResourceGroup, _> = repositories
            .circuit_breakers
            .load_all()
            .await?
            .into_iter()
            .map(|snapshot| (snapshot.resource_group, snapshot))
            .collect();

        let counters = EngineCounters::new();
        let context = SchedulerContext {
            repositories: repositories.clone(),
            clock: clock.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            task_timeout: config.queue.task_timeout(),
            counters: counters.clone(),
            session_id: session_id.clone(),
        };

        let mut schedulers = HashMap::new();
        let mut tasks = Vec::new();
        for group in ResourceGroup::ALL {
            let breaker = match persisted.get(&group) {
                Some(snapshot) => {
                    if snapshot.state != CircuitState::Closed {
                        warn!(
                            "资源组 {} 恢复持久化的熔断状态 {}",
                            group, snapshot.state
                        );
                    }
                    CircuitBreaker::restore(snapshot, breaker_config.clone())
                }
                None => CircuitBreaker::new(group, breaker_config.clone(), clock.now()),
            };

            let handle = GroupScheduler::spawn(
                group,
                config.resource_groups.limits_for(group),
                breaker,
                context.clone(),
            );
            schedulers.insert(
                group,
                SchedulerSlot {
                    commands: handle.commands,
                    gauges: handle.gauges,
                    max_concurrency: handle.max_concurrency,
                },
            );
            tasks.push((handle.join, handle.persister));
        }

        let monitor = Arc::new(ResourceMonitor::new());
        let reporter = Arc::new(MetricsReporter::new(
            repositories.clone(),
            clock.clone(),
            monitor.clone(),
        ));

        let mut services = BackgroundServices::default();
        if config.heartbeat.enabled {
            let writer = HeartbeatWriter::new(
                session_id.clone(),
                repositories.clone(),
                clock.clone(),
                counters.clone(),
                ResourceGroup::ALL
                    .iter()
                    .filter_map(|group| schedulers.get(group).map(|slot| slot.gauges.clone()))
                    .collect(),
                monitor,
                &config.heartbeat,
            );
            let mut heartbeat = HeartbeatService::new(Arc::new(writer), &config.heartbeat);
            heartbeat.start();
            services.heartbeat = Some(heartbeat);
        }
        if config.metrics.enabled {
            let mut metrics = MetricsService::new(reporter.clone(), session_id.clone(), &config.metrics);
            metrics.start();
            services.metrics = Some(metrics);
        }
        if config.cleanup.enabled {
            let mut cleanup =
                CleanupService::new(repositories.clone(), config.cleanup.clone(), clock.clone());
            cleanup.start().await?;
            services.cleanup = Some(cleanup);
        }

        info!("队列引擎已启动, 会话 {}", session_id);

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                repositories,
                clock,
                session_id,
                schedulers,
                tasks: Mutex::new(tasks),
                services: Mutex::new(services),
                counters,
                sessions,
                reporter,
                accepting: AtomicBool::new(true),
                shutdown_started: AtomicBool::new(false),
            }),
        };

        if engine.inner.config.queue.recover_orphaned_sessions {
            if let Err(e) = engine.recover_orphaned_sessions().await {
                if let Err(shutdown_err) = engine.shutdown().await {
                    warn!("回收遗留会话失败后关闭引擎出错: {}", shutdown_err);
                }
                return Err(e);
            }
        }

        Ok(engine)
    }

    /// 回收崩溃进程留下的会话: 待执行任务经由 `clear_queue_for_new_session` 取消
    async fn recover_orphaned_sessions(&self) -> QueueResult<()> {
        let orphans = self.inner.sessions.find_orphans(&self.inner.session_id).await?;
        for orphan in &orphans {
            let cancelled = self.clear_queue_for_new_session(&orphan.session_id).await?;
            self.inner.sessions.retire_orphan(orphan, cancelled).await?;
        }
        if !orphans.is_empty() {
            info!("启动时回收了 {} 个遗留会话", orphans.len());
        }
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn repositories(&self) -> &QueueRepositories {
        &self.inner.repositories
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// 提交任务，立即返回任务ID，执行结果只体现在任务行上
    pub async fn enqueue(
        &self,
        request: TaskRequest,
        executor: Arc<dyn TaskExecutor>,
    ) -> QueueResult<String> {
        self.route(request, executor, None).await
    }

    /// 提交任务并返回可等待的句柄
    pub async fn submit(
        &self,
        request: TaskRequest,
        executor: Arc<dyn TaskExecutor>,
    ) -> QueueResult<TaskHandle> {
        let (completion, receiver) = oneshot::channel();
        let task_id = self.route(request, executor, Some(completion)).await?;
        Ok(TaskHandle { task_id, receiver })
    }

    /// 提交任务并等待其结束
    pub async fn enqueue_and_wait(
        &self,
        request: TaskRequest,
        executor: Arc<dyn TaskExecutor>,
    ) -> QueueResult<TaskOutcome> {
        self.submit(request, executor).await?.wait().await
    }

    async fn route(
        &self,
        request: TaskRequest,
        executor: Arc<dyn TaskExecutor>,
        completion: Option<CompletionSender>,
    ) -> QueueResult<String> {
        let inner = &self.inner;
        if !self.is_accepting() {
            return Err(QueueError::unavailable("队列引擎正在关闭"));
        }

        request.validate(inner.config.queue.max_retries_limit)?;
        let task = request.into_task(
            &inner.session_id,
            inner.config.queue.default_max_retries,
            inner.clock.now(),
        );
        let slot = inner.scheduler(task.resource_group)?;

        inner.repositories.tasks.insert(&task).await?;
        inner.counters.record_submitted();

        let task_id = task.id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = SchedulerCommand::Submit {
            task,
            executor,
            completion,
            reply: reply_tx,
        };

        let accepted = match slot.commands.send(command).await {
            Ok(()) => reply_rx
                .await
                .unwrap_or_else(|_| Err(QueueError::unavailable("资源组调度器已停止"))),
            Err(_) => Err(QueueError::unavailable("资源组调度器已停止")),
        };

        if let Err(e) = accepted {
            inner.counters.record_terminal(false);
            if let Err(mark_err) = inner
                .repositories
                .tasks
                .mark_failed(&task_id, inner.clock.now(), &e.to_string(), None)
                .await
            {
                warn!("记录被拒绝任务 {} 的状态失败: {}", task_id, mark_err);
            }
            return Err(e);
        }

        debug!("任务 {} 已提交", task_id);
        Ok(task_id)
    }

    /// 即时状态，只读取调度器发布的计数，不经过调度器
    pub fn get_status(&self) -> QueueStatus {
        let groups: Vec<GroupStatus> = ResourceGroup::ALL
            .iter()
            .filter_map(|group| self.inner.schedulers.get(group))
            .map(|slot| GroupStatus {
                resource_group: slot.gauges.resource_group(),
                queued: slot.gauges.queued(),
                delayed: slot.gauges.delayed(),
                running: slot.gauges.running(),
                max_concurrency: slot.max_concurrency,
                circuit_state: slot.gauges.circuit_state(),
            })
            .collect();

        QueueStatus {
            session_id: self.inner.session_id.clone(),
            accepting: self.is_accepting(),
            per_group_queue_depth: groups
                .iter()
                .map(|g| (g.resource_group, g.queued + g.delayed))
                .collect(),
            running_count: groups.iter().map(|g| g.running).sum(),
            active_workers: groups.iter().filter(|g| g.running > 0).count(),
            groups,
        }
    }

    /// 从任务行计算会话指标
    pub async fn get_metrics(&self, session_id: &str) -> QueueResult<QueueMetrics> {
        self.inner.reporter.compute(session_id).await
    }

    /// 计算当前会话指标并写入快照
    pub async fn snapshot_metrics(&self) -> QueueResult<QueueMetrics> {
        self.inner.reporter.snapshot_now(&self.inner.session_id).await
    }

    /// 最近一次写入的指标快照
    pub async fn latest_metrics(&self) -> Option<QueueMetrics> {
        self.inner.reporter.latest().await
    }

    /// 取消会话中所有 pending 任务，运行中的任务不受影响
    pub async fn clear_queue_for_new_session(&self, session_id: &str) -> QueueResult<u64> {
        let mut removed = 0;
        for slot in self.inner.schedulers.values() {
            let (reply_tx, reply_rx) = oneshot::channel();
            let command = SchedulerCommand::CancelSession {
                session_id: session_id.to_string(),
                reply: reply_tx,
            };
            if slot.commands.send(command).await.is_ok() {
                removed += reply_rx.await.unwrap_or(0);
            }
        }

        let cancelled = self
            .inner
            .repositories
            .tasks
            .cancel_pending_for_session(session_id, self.inner.clock.now())
            .await?;

        info!(
            "会话 {} 的待执行任务已取消: {} 行 (其中 {} 个在内存队列中)",
            session_id, cancelled, removed
        );
        Ok(cancelled)
    }

    /// 优雅关闭: 停止接收、取消排队任务、等待运行中的任务结束、关闭会话
    pub async fn shutdown(&self) -> QueueResult<()> {
        let inner = &self.inner;
        if inner.shutdown_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.accepting.store(false, Ordering::SeqCst);
        info!("队列引擎开始关闭, 会话 {}", inner.session_id);

        let mut drained_sessions = BTreeSet::new();
        drained_sessions.insert(inner.session_id.clone());

        let mut waiters = Vec::new();
        for slot in inner.schedulers.values() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if slot
                .commands
                .send(SchedulerCommand::Drain { reply: reply_tx })
                .await
                .is_ok()
            {
                waiters.push(reply_rx);
            }
        }
        for waiter in waiters {
            if let Ok(sessions) = waiter.await {
                drained_sessions.extend(sessions);
            }
        }

        let tasks = std::mem::take(&mut *inner.tasks.lock().await);
        for (scheduler, persister) in tasks {
            if let Err(e) = scheduler.await {
                error!("调度器任务异常退出: {}", e);
            }
            if let Err(e) = persister.await {
                error!("熔断状态持久化任务异常退出: {}", e);
            }
        }

        for session_id in &drained_sessions {
            match inner
                .repositories
                .tasks
                .cancel_pending_for_session(session_id, inner.clock.now())
                .await
            {
                Ok(0) => {}
                Ok(count) => info!("关闭时取消会话 {} 的 {} 个待执行任务", session_id, count),
                Err(e) => warn!("关闭时取消会话 {} 的任务失败: {}", session_id, e),
            }
        }

        let mut services = inner.services.lock().await;
        if let Some(mut heartbeat) = services.heartbeat.take() {
            heartbeat.stop().await;
        }
        if let Some(mut metrics) = services.metrics.take() {
            metrics.stop().await;
        }
        if let Some(mut cleanup) = services.cleanup.take() {
            cleanup.stop().await?;
        }
        drop(services);

        inner
            .sessions
            .close(&inner.session_id, inner.counters.session_counters())
            .await?;

        info!("队列引擎已关闭");
        Ok(())
    }
}

impl EngineInner {
    fn scheduler(&self, group: ResourceGroup) -> QueueResult<&SchedulerSlot> {
        self.schedulers
            .get(&group)
            .ok_or_else(|| QueueError::Internal(format!("资源组 {group} 没有调度器")))
    }
}

#[async_trait]
impl TaskSubmitter for QueueEngine {
    async fn submit_and_wait(
        &self,
        request: TaskRequest,
        executor: Arc<dyn TaskExecutor>,
    ) -> QueueResult<TaskOutcome> {
        self.enqueue_and_wait(request, executor).await
    }
}
