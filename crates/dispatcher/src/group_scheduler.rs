//! 资源组调度器
//!
//! 每个资源组一个调度 actor，独占该组的优先级队列和熔断器，只通过通道与引擎交互。
//! 调度器负责:
//! - 并发上限: 同时运行的任务数不超过 `max_concurrency`
//! - 启动节流: 相邻两次启动间隔不小于 `min_delay`
//! - 熔断门控: Open 时立即以 `CircuitOpen` 失败，HalfOpen 时只放行一个探测任务
//! - 失败重试: 可重试错误在退避后重新入队，次数用尽后进入 failed

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use taskgate_core::{
    Admission, CircuitBreaker, CircuitBreakerSnapshot, CircuitState, Clock, Permit,
    QueueRepositories, QueueTask, ResourceGroup, ResourceGroupLimits, TaskExecutionContext,
    TaskExecutor, TaskOutcome,
};
use taskgate_errors::{QueueError, QueueResult};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;
use crate::stats::{EngineCounters, GroupGauges};

const COMMAND_BUFFER: usize = 256;

pub(crate) type CompletionSender = oneshot::Sender<QueueResult<TaskOutcome>>;

/// 发给调度器的命令
pub(crate) enum SchedulerCommand {
    Submit {
        task: QueueTask,
        executor: Arc<dyn TaskExecutor>,
        completion: Option<CompletionSender>,
        reply: oneshot::Sender<QueueResult<()>>,
    },
    /// 移除队列中属于该会话的任务，返回移除数量
    CancelSession {
        session_id: String,
        reply: oneshot::Sender<usize>,
    },
    /// 停止接收并取消排队任务，运行中的任务结束后回复被取消任务所属的会话
    Drain { reply: oneshot::Sender<Vec<String>> },
}

/// 调度器共享的运行环境
#[derive(Clone)]
pub(crate) struct SchedulerContext {
    pub repositories: QueueRepositories,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryPolicy,
    pub task_timeout: Option<Duration>,
    pub counters: Arc<EngineCounters>,
    pub session_id: String,
}

struct QueuedTask {
    sequence: u64,
    task: QueueTask,
    executor: Arc<dyn TaskExecutor>,
    completion: Option<CompletionSender>,
}

impl QueuedTask {
    fn complete(mut self, result: QueueResult<TaskOutcome>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }
}

// 数值越小的优先级越先出队，同优先级按提交顺序
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

struct DelayedTask {
    ready_at: Instant,
    entry: QueuedTask,
}

enum AttemptResult {
    /// 任务在启动前已被取消
    Skipped,
    Succeeded {
        output: serde_json::Value,
        elapsed: Duration,
    },
    Failed {
        error: QueueError,
        elapsed: Duration,
        will_retry: bool,
    },
}

struct AttemptFinished {
    entry: QueuedTask,
    permit: Permit,
    result: AttemptResult,
}

/// 调度器句柄，由引擎持有
pub(crate) struct GroupSchedulerHandle {
    pub resource_group: ResourceGroup,
    pub commands: mpsc::Sender<SchedulerCommand>,
    pub gauges: Arc<GroupGauges>,
    pub max_concurrency: usize,
    pub join: JoinHandle<()>,
    pub persister: JoinHandle<()>,
}

pub(crate) struct GroupScheduler {
    resource_group: ResourceGroup,
    limits: ResourceGroupLimits,
    breaker: CircuitBreaker,
    ctx: SchedulerContext,
    gauges: Arc<GroupGauges>,
    snapshots: watch::Sender<CircuitBreakerSnapshot>,
    queue: BinaryHeap<QueuedTask>,
    delayed: Vec<DelayedTask>,
    running: usize,
    last_started: Option<Instant>,
    sequence: u64,
    accepting: bool,
    drain_waiters: Vec<oneshot::Sender<Vec<String>>>,
    drained_sessions: BTreeSet<String>,
    events: mpsc::UnboundedSender<AttemptFinished>,
}

impl GroupScheduler {
    /// 启动调度 actor 和熔断状态持久化任务
    pub(crate) fn spawn(
        resource_group: ResourceGroup,
        limits: ResourceGroupLimits,
        breaker: CircuitBreaker,
        ctx: SchedulerContext,
    ) -> GroupSchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(breaker.snapshot(&ctx.session_id));
        let gauges = GroupGauges::new(resource_group);

        let persister = tokio::spawn(persist_breaker_snapshots(
            resource_group,
            snapshot_rx,
            ctx.repositories.clone(),
        ));

        let scheduler = Self {
            resource_group,
            limits,
            breaker,
            ctx,
            gauges: gauges.clone(),
            snapshots: snapshot_tx,
            queue: BinaryHeap::new(),
            delayed: Vec::new(),
            running: 0,
            last_started: None,
            sequence: 0,
            accepting: true,
            drain_waiters: Vec::new(),
            drained_sessions: BTreeSet::new(),
            events: events_tx,
        };
        let join = tokio::spawn(scheduler.run(command_rx, events_rx));

        GroupSchedulerHandle {
            resource_group,
            commands: command_tx,
            gauges,
            max_concurrency: limits.max_concurrency,
            join,
            persister,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SchedulerCommand>,
        mut events: mpsc::UnboundedReceiver<AttemptFinished>,
    ) {
        info!(
            "资源组 {} 调度器启动, 并发上限 {}, 最小间隔 {:?}",
            self.resource_group, self.limits.max_concurrency, self.limits.min_delay
        );
        self.publish();

        let mut commands_open = true;
        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // 引擎被丢弃而没有调用 shutdown
                        commands_open = false;
                        self.begin_drain();
                    }
                },
                Some(finished) = events.recv() => self.handle_attempt_finished(finished),
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }

            self.promote_due_retries();
            self.dispatch();
            self.publish();

            if !self.accepting && self.running == 0 {
                let sessions: Vec<String> = self.drained_sessions.iter().cloned().collect();
                for waiter in self.drain_waiters.drain(..) {
                    let _ = waiter.send(sessions.clone());
                }
                break;
            }
        }

        info!("资源组 {} 调度器已停止", self.resource_group);
    }

    fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Submit {
                task,
                executor,
                completion,
                reply,
            } => {
                let result = self.accept(task, executor, completion);
                let _ = reply.send(result);
            }
            SchedulerCommand::CancelSession { session_id, reply } => {
                let removed = self.remove_where(|task| task.session_id == session_id);
                if removed > 0 {
                    info!(
                        "资源组 {} 移除了会话 {} 的 {} 个排队任务",
                        self.resource_group, session_id, removed
                    );
                }
                let _ = reply.send(removed);
            }
            SchedulerCommand::Drain { reply } => {
                self.begin_drain();
                self.drain_waiters.push(reply);
            }
        }
    }

    fn accept(
        &mut self,
        task: QueueTask,
        executor: Arc<dyn TaskExecutor>,
        completion: Option<CompletionSender>,
    ) -> QueueResult<()> {
        if !self.accepting {
            return Err(QueueError::unavailable(format!(
                "资源组 {} 调度器正在关闭",
                self.resource_group
            )));
        }

        let now = self.ctx.clock.now();
        if let Err(e) = self.breaker.check_admission(now) {
            counter!("taskgate_circuit_rejections_total", "resource_group" => self.resource_group.as_str())
                .increment(1);
            debug!("熔断拒绝任务 {}: {}", task.id, e);
            return Err(e);
        }

        debug!("任务 {} 进入资源组 {} 队列", task.id, self.resource_group);
        let sequence = self.next_sequence();
        self.queue.push(QueuedTask {
            sequence,
            task,
            executor,
            completion,
        });
        Ok(())
    }

    fn begin_drain(&mut self) {
        self.accepting = false;
        let removed = self.remove_where(|_| true);
        if removed > 0 {
            info!(
                "资源组 {} 关闭时取消了 {} 个排队任务",
                self.resource_group, removed
            );
        }
    }

    /// 移除排队和等待重试中满足条件的任务，通知等待方已取消
    fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&QueueTask) -> bool,
    {
        let mut removed = Vec::new();

        let (matched, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_vec()
            .into_iter()
            .partition(|entry| predicate(&entry.task));
        self.queue = kept.into();
        removed.extend(matched);

        let (matched, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|delayed| predicate(&delayed.entry.task));
        self.delayed = kept;
        removed.extend(matched.into_iter().map(|delayed| delayed.entry));

        let count = removed.len();
        for entry in removed {
            self.cancel(entry);
        }
        count
    }

    /// 取消未完成的任务，任务行由关闭流程或 `clear_queue_for_new_session` 统一标记
    fn cancel(&mut self, entry: QueuedTask) {
        self.ctx.counters.record_cancelled();
        self.drained_sessions.insert(entry.task.session_id.clone());
        let task_id = entry.task.id.clone();
        entry.complete(Err(QueueError::cancelled(task_id)));
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn throttle_until(&self) -> Option<Instant> {
        self.last_started
            .map(|started| started + self.limits.min_delay)
            .filter(|at| *at > Instant::now())
    }

    fn next_wake(&self) -> Option<Instant> {
        let retry_wake = self.delayed.iter().map(|delayed| delayed.ready_at).min();
        let throttle_wake = if !self.queue.is_empty() && self.running < self.limits.max_concurrency
        {
            self.throttle_until()
        } else {
            None
        };
        match (retry_wake, throttle_wake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn promote_due_retries(&mut self) {
        if self.delayed.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|delayed| delayed.ready_at <= now);
        self.delayed = waiting;

        for delayed in due {
            let mut entry = delayed.entry;
            entry.sequence = self.next_sequence();
            debug!(
                "任务 {} 退避结束, 第 {} 次重试重新入队",
                entry.task.id, entry.task.retry_count
            );
            self.queue.push(entry);
        }
    }

    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let now = self.ctx.clock.now();

            if self.breaker.state(now) == CircuitState::Open {
                if let Some(entry) = self.queue.pop() {
                    let error = self.breaker.open_error(now);
                    self.reject(entry, error);
                }
                continue;
            }

            if self.running >= self.limits.max_concurrency {
                break;
            }
            if self.throttle_until().is_some() {
                break;
            }

            match self.breaker.admit(now) {
                Admission::Allowed(permit) => {
                    if let Some(entry) = self.queue.pop() {
                        self.start_attempt(entry, permit);
                    }
                }
                Admission::ProbeInFlight => break,
                Admission::Rejected { retry_after } => {
                    if let Some(entry) = self.queue.pop() {
                        let error = QueueError::circuit_open(
                            self.resource_group.as_str(),
                            retry_after.as_millis() as u64,
                        );
                        self.reject(entry, error);
                    }
                }
            }
        }
    }

    /// 熔断打开时快速失败，任务行标记为 failed
    fn reject(&mut self, entry: QueuedTask, error: QueueError) {
        counter!("taskgate_circuit_rejections_total", "resource_group" => self.resource_group.as_str())
            .increment(1);
        self.ctx.counters.record_terminal(false);
        warn!("{} 因熔断被拒绝: {}", entry.task.entity_description(), error);

        let tasks = self.ctx.repositories.tasks.clone();
        let failed_at = self.ctx.clock.now();
        tokio::spawn(async move {
            if let Err(e) = tasks
                .mark_failed(&entry.task.id, failed_at, &error.to_string(), None)
                .await
            {
                warn!("记录任务 {} 熔断失败状态出错: {}", entry.task.id, e);
            }
            entry.complete(Err(error));
        });
    }

    fn start_attempt(&mut self, entry: QueuedTask, permit: Permit) {
        self.running += 1;
        self.last_started = Some(Instant::now());
        counter!("taskgate_tasks_started_total", "resource_group" => self.resource_group.as_str())
            .increment(1);
        debug!(
            "启动 {} 第 {} 次尝试 ({:?})",
            entry.task.entity_description(),
            entry.task.attempts(),
            permit
        );

        let ctx = self.ctx.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = run_attempt(&ctx, &entry.task, entry.executor.as_ref()).await;
            let _ = events.send(AttemptFinished {
                entry,
                permit,
                result,
            });
        });
    }

    fn handle_attempt_finished(&mut self, finished: AttemptFinished) {
        self.running = self.running.saturating_sub(1);
        let AttemptFinished {
            mut entry,
            permit,
            result,
        } = finished;
        let now = self.ctx.clock.now();
        let group = self.resource_group.as_str();

        match result {
            AttemptResult::Skipped => {
                if permit == Permit::Probe {
                    self.breaker.release_probe();
                }
                debug!("任务 {} 已被取消, 跳过执行", entry.task.id);
                self.cancel(entry);
            }
            AttemptResult::Succeeded { output, elapsed } => {
                self.breaker.record_success(permit, now);
                self.ctx.counters.record_attempt_success();
                self.ctx.counters.record_terminal(true);
                counter!("taskgate_tasks_completed_total", "resource_group" => group).increment(1);
                histogram!("taskgate_task_duration_ms", "resource_group" => group)
                    .record(elapsed.as_millis() as f64);

                let outcome = TaskOutcome {
                    task_id: entry.task.id.clone(),
                    output,
                    attempts: entry.task.attempts(),
                    duration: elapsed,
                };
                entry.complete(Ok(outcome));
            }
            AttemptResult::Failed {
                error,
                elapsed,
                will_retry,
            } => {
                self.breaker.record_failure(permit, now);
                self.ctx.counters.record_attempt_failure();
                histogram!("taskgate_task_duration_ms", "resource_group" => group)
                    .record(elapsed.as_millis() as f64);

                if will_retry && !self.accepting {
                    info!(
                        "{} 执行失败: {}, 调度器正在关闭, 不再重试",
                        entry.task.entity_description(),
                        error
                    );
                    self.cancel(entry);
                } else if will_retry {
                    let delay = self.ctx.retry.delay_for(entry.task.retry_count);
                    entry.task.retry_count += 1;
                    entry.task.last_error = Some(error.to_string());
                    counter!("taskgate_task_retries_total", "resource_group" => group).increment(1);
                    info!(
                        "{} 执行失败: {}, {:?} 后进行第 {} 次重试",
                        entry.task.entity_description(),
                        error,
                        delay,
                        entry.task.retry_count
                    );
                    self.delayed.push(DelayedTask {
                        ready_at: Instant::now() + delay,
                        entry,
                    });
                } else {
                    self.ctx.counters.record_terminal(false);
                    counter!("taskgate_tasks_failed_total", "resource_group" => group).increment(1);
                    let error = if error.is_retryable() {
                        QueueError::RetryExhausted {
                            task_id: entry.task.id.clone(),
                            attempts: entry.task.attempts(),
                            last_error: error.to_string(),
                        }
                    } else {
                        error
                    };
                    error!("{} 最终失败: {}", entry.task.entity_description(), error);
                    entry.complete(Err(error));
                }
            }
        }
    }

    fn publish(&mut self) {
        let state = self.breaker.state(self.ctx.clock.now());
        self.gauges
            .publish(self.queue.len(), self.delayed.len(), self.running, state);

        let snapshot = self.breaker.snapshot(&self.ctx.session_id);
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                if current.state != snapshot.state {
                    info!(
                        "资源组 {} 熔断状态 {} -> {}",
                        self.resource_group, current.state, snapshot.state
                    );
                }
                *current = snapshot;
                true
            }
        });
    }
}

/// 执行一次尝试并持久化结果
async fn run_attempt(
    ctx: &SchedulerContext,
    task: &QueueTask,
    executor: &dyn TaskExecutor,
) -> AttemptResult {
    let tasks = &ctx.repositories.tasks;

    match tasks.mark_started(&task.id, ctx.clock.now()).await {
        Ok(true) => {}
        Ok(false) => return AttemptResult::Skipped,
        Err(e) => warn!("记录任务 {} 开始状态失败, 继续执行: {}", task.id, e),
    }

    let context = TaskExecutionContext::for_task(task);
    let started = Instant::now();
    let result = execute_guarded(executor, &context, ctx.task_timeout).await;
    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;

    match result {
        Ok(output) => {
            if let Err(e) = tasks
                .mark_completed(&task.id, ctx.clock.now(), elapsed_ms)
                .await
            {
                warn!("记录任务 {} 完成状态失败: {}", task.id, e);
            }
            AttemptResult::Succeeded { output, elapsed }
        }
        Err(error) => {
            let will_retry = error.is_retryable() && task.retry_count < task.max_retries;
            let persisted = if will_retry {
                tasks
                    .mark_retry(&task.id, task.retry_count + 1, &error.to_string())
                    .await
            } else {
                tasks
                    .mark_failed(
                        &task.id,
                        ctx.clock.now(),
                        &error.to_string(),
                        Some(elapsed_ms),
                    )
                    .await
            };
            if let Err(e) = persisted {
                warn!("记录任务 {} 失败状态出错: {}", task.id, e);
            }
            AttemptResult::Failed {
                error,
                elapsed,
                will_retry,
            }
        }
    }
}

/// 执行器 panic 转换为操作错误，超时转换为可重试的超时错误
async fn execute_guarded(
    executor: &dyn TaskExecutor,
    context: &TaskExecutionContext,
    timeout: Option<Duration>,
) -> QueueResult<serde_json::Value> {
    let guarded = AssertUnwindSafe(executor.execute(context)).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(QueueError::Timeout(format!(
                    "任务 {} 超过 {:?} 未完成",
                    context.task_id, limit
                )))
            }
        },
        None => guarded.await,
    };

    outcome.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(QueueError::operation(format!("执行器 panic: {message}")))
    })
}

/// 按最新值语义持久化熔断器快照
async fn persist_breaker_snapshots(
    resource_group: ResourceGroup,
    mut snapshots: watch::Receiver<CircuitBreakerSnapshot>,
    repositories: QueueRepositories,
) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Err(e) = repositories.circuit_breakers.upsert(&snapshot).await {
            warn!("持久化资源组 {} 熔断状态失败: {}", resource_group, e);
        }
    }
    debug!("资源组 {} 熔断状态持久化任务结束", resource_group);
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_core::{CircuitBreakerConfig, SystemClock, TaskStatus, DEFAULT_PRIORITY};
    use taskgate_testing_utils::{InMemoryStore, ScriptStep, ScriptedExecutor};

    fn entry(id: &str, priority: u8, sequence: u64) -> QueuedTask {
        struct Noop;
        #[async_trait::async_trait]
        impl TaskExecutor for Noop {
            async fn execute(&self, _: &TaskExecutionContext) -> QueueResult<serde_json::Value> {
                Ok(serde_json::Value::Null)
            }
        }

        let mut task = taskgate_core::TaskRequest::new("hash")
            .with_id(id)
            .with_priority(priority)
            .into_task("s", 0, chrono::Utc::now());
        task.status = TaskStatus::Pending;
        QueuedTask {
            sequence,
            task,
            executor: Arc::new(Noop),
            completion: None,
        }
    }

    #[test]
    fn test_queue_order_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(entry("b", DEFAULT_PRIORITY, 2));
        heap.push(entry("a", DEFAULT_PRIORITY, 1));
        heap.push(entry("urgent", 1, 3));
        heap.push(entry("low", 10, 0));
        heap.push(entry("c", DEFAULT_PRIORITY, 4));

        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|e| e.task.id)).collect();
        assert_eq!(order, vec!["urgent", "a", "b", "c", "low"]);
    }

    #[tokio::test]
    async fn test_panic_becomes_operation_error() {
        struct Panicking;
        #[async_trait::async_trait]
        impl TaskExecutor for Panicking {
            async fn execute(&self, _: &TaskExecutionContext) -> QueueResult<serde_json::Value> {
                panic!("boom")
            }
        }

        let task = entry("p", DEFAULT_PRIORITY, 1).task;
        let context = TaskExecutionContext::for_task(&task);
        let err = execute_guarded(&Panicking, &context, None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        struct Slow;
        #[async_trait::async_trait]
        impl TaskExecutor for Slow {
            async fn execute(&self, _: &TaskExecutionContext) -> QueueResult<serde_json::Value> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(serde_json::Value::Null)
            }
        }

        let task = entry("slow", DEFAULT_PRIORITY, 1).task;
        let context = TaskExecutionContext::for_task(&task);
        let err = execute_guarded(&Slow, &context, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Timeout(_)));
        assert!(err.is_retryable());
    }

    /// 关闭时正在运行的任务失败后不再重试，调用方收到取消
    #[tokio::test]
    async fn test_retry_after_drain_is_cancelled() {
        let store = InMemoryStore::new();
        let counters = EngineCounters::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();
        let ctx = SchedulerContext {
            repositories: store.repositories(),
            clock,
            retry: RetryPolicy::default(),
            task_timeout: None,
            counters: counters.clone(),
            session_id: "s".to_string(),
        };
        let breaker = CircuitBreaker::new(
            ResourceGroup::Computation,
            CircuitBreakerConfig::default(),
            now,
        );
        let handle = GroupScheduler::spawn(
            ResourceGroup::Computation,
            ResourceGroupLimits::new(1, Duration::ZERO),
            breaker,
            ctx,
        );

        let task = taskgate_core::TaskRequest::new("hash")
            .with_id("flaky")
            .with_max_retries(3)
            .into_task("s", 0, now);
        store.repositories().tasks.insert(&task).await.unwrap();
        let executor = Arc::new(
            ScriptedExecutor::always(ScriptStep::FailRetryable("io".into()))
                .with_delay(Duration::from_millis(100)),
        );

        let (completion, outcome) = oneshot::channel();
        let (reply, accepted) = oneshot::channel();
        handle
            .commands
            .send(SchedulerCommand::Submit {
                task,
                executor: executor.clone(),
                completion: Some(completion),
                reply,
            })
            .await
            .unwrap();
        accepted.await.unwrap().unwrap();

        // 第一次尝试还在运行时开始关闭
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (drain_tx, drained) = oneshot::channel();
        handle
            .commands
            .send(SchedulerCommand::Drain { reply: drain_tx })
            .await
            .unwrap();

        assert_eq!(drained.await.unwrap(), vec!["s".to_string()]);
        let result = outcome.await.unwrap();
        assert!(matches!(result, Err(QueueError::Cancelled { .. })));
        assert_eq!(executor.calls(), 1);
        assert_eq!(counters.tasks_cancelled(), 1);
        // 任务行保持 pending，由关闭流程统一取消
        assert_eq!(store.task("flaky").unwrap().status, TaskStatus::Pending);
        handle.join.await.unwrap();
    }
}
