//! Mock implementations for the repository and collaborator traits
//!
//! This module provides in-memory implementations that can be used for unit
//! testing the queue engine without a SQLite file, plus scripted executors and
//! fake filesystem/network collaborators.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskgate_core::{
    CircuitBreakerRepository, CircuitBreakerSnapshot, DirEntryInfo, FileSystemOperations,
    HeartbeatRepository, HttpResponse, MetricsRepository, NetworkOperations, ProcessHeartbeat,
    QueueMetrics, QueueRepositories, QueueSession, QueueTask, ResourceGroup,
    ResourceGroupPerformance, SessionCounters, SessionRepository, SessionStatus, SessionSummary,
    success_rate, TaskAggregate, TaskExecutionContext, TaskExecutor, TaskRepository, TaskStatus,
};
use taskgate_errors::{QueueError, QueueResult};

#[derive(Default)]
struct StoreState {
    tasks: Vec<QueueTask>,
    sessions: Vec<QueueSession>,
    metrics: Vec<QueueMetrics>,
    heartbeats: Vec<ProcessHeartbeat>,
    breakers: BTreeMap<ResourceGroup, CircuitBreakerSnapshot>,
}

/// In-memory implementation of every repository trait
///
/// Clones share the same state, so a test can hand `repositories()` to the
/// engine and still inspect rows afterwards.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repositories(&self) -> QueueRepositories {
        QueueRepositories {
            tasks: Arc::new(self.clone()),
            sessions: Arc::new(self.clone()),
            metrics: Arc::new(self.clone()),
            heartbeats: Arc::new(self.clone()),
            circuit_breakers: Arc::new(self.clone()),
        }
    }

    /// Make every subsequent write fail with a persistence error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn all_tasks(&self) -> Vec<QueueTask> {
        self.state.lock().unwrap().tasks.clone()
    }

    pub fn task(&self, id: &str) -> Option<QueueTask> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .count()
    }

    pub fn sessions(&self) -> Vec<QueueSession> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn heartbeats(&self) -> Vec<ProcessHeartbeat> {
        self.state.lock().unwrap().heartbeats.clone()
    }

    pub fn breaker(&self, group: ResourceGroup) -> Option<CircuitBreakerSnapshot> {
        self.state.lock().unwrap().breakers.get(&group).cloned()
    }

    fn check_writable(&self) -> QueueResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(QueueError::persistence("模拟写入失败"))
        } else {
            Ok(())
        }
    }

    fn update_task<F>(&self, id: &str, expected: &[TaskStatus], apply: F) -> QueueResult<bool>
    where
        F: FnOnce(&mut QueueTask),
    {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        match state
            .tasks
            .iter_mut()
            .find(|t| t.id == id && expected.contains(&t.status))
        {
            Some(task) => {
                apply(task);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn summary_for(session: &QueueSession, tasks: &[QueueTask]) -> SessionSummary {
        let owned: Vec<&QueueTask> = tasks
            .iter()
            .filter(|t| t.session_id == session.session_id)
            .collect();
        let count = |status: TaskStatus| owned.iter().filter(|t| t.status == status).count() as u64;
        let completed = count(TaskStatus::Completed);
        let failed = count(TaskStatus::Failed);
        SessionSummary {
            session_id: session.session_id.clone(),
            process_id: session.process_id,
            started_at: session.started_at,
            last_activity: session.last_activity,
            total_tasks: owned.len() as u64,
            pending_tasks: count(TaskStatus::Pending),
            running_tasks: count(TaskStatus::Running),
            completed_tasks: completed,
            failed_tasks: failed,
            cancelled_tasks: count(TaskStatus::Cancelled),
            success_rate: success_rate(completed, failed),
        }
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn insert(&self, task: &QueueTask) -> QueueResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        if state.tasks.iter().any(|t| t.id == task.id) {
            return Err(QueueError::validation(format!("任务ID已存在: {}", task.id)));
        }
        state.tasks.push(task.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> QueueResult<Option<QueueTask>> {
        Ok(self.task(id))
    }

    async fn list_by_session(
        &self,
        session_id: &str,
        status: Option<TaskStatus>,
    ) -> QueueResult<Vec<QueueTask>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.session_id == session_id)
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    async fn mark_started(&self, id: &str, started_at: DateTime<Utc>) -> QueueResult<bool> {
        self.update_task(id, &[TaskStatus::Pending], |task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(started_at);
        })
    }

    async fn mark_completed(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        actual_duration_ms: u64,
    ) -> QueueResult<bool> {
        self.update_task(id, &[TaskStatus::Running], |task| {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(completed_at);
            task.actual_duration_ms = Some(actual_duration_ms);
        })
    }

    async fn mark_retry(&self, id: &str, retry_count: u32, last_error: &str) -> QueueResult<bool> {
        self.update_task(id, &[TaskStatus::Running], |task| {
            task.status = TaskStatus::Pending;
            task.retry_count = retry_count;
            task.last_error = Some(last_error.to_string());
        })
    }

    async fn mark_failed(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        last_error: &str,
        actual_duration_ms: Option<u64>,
    ) -> QueueResult<bool> {
        self.update_task(id, &[TaskStatus::Pending, TaskStatus::Running], |task| {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(completed_at);
            task.last_error = Some(last_error.to_string());
            if actual_duration_ms.is_some() {
                task.actual_duration_ms = actual_duration_ms;
            }
        })
    }

    async fn cancel_pending_for_session(
        &self,
        session_id: &str,
        cancelled_at: DateTime<Utc>,
    ) -> QueueResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.session_id == session_id && t.status == TaskStatus::Pending)
        {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(cancelled_at);
            count += 1;
        }
        Ok(count)
    }

    async fn fail_running_for_session(
        &self,
        session_id: &str,
        failed_at: DateTime<Utc>,
        reason: &str,
    ) -> QueueResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.session_id == session_id && t.status == TaskStatus::Running)
        {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(failed_at);
            task.last_error = Some(reason.to_string());
            count += 1;
        }
        Ok(count)
    }

    async fn aggregate_by_session(&self, session_id: &str) -> QueueResult<Vec<TaskAggregate>> {
        let state = self.state.lock().unwrap();
        let mut groups: BTreeMap<(ResourceGroup, &'static str), TaskAggregate> = BTreeMap::new();
        for task in state.tasks.iter().filter(|t| t.session_id == session_id) {
            let entry = groups
                .entry((task.resource_group, task.status.as_str()))
                .or_insert_with(|| TaskAggregate {
                    resource_group: task.resource_group,
                    status: task.status,
                    count: 0,
                    timed_count: 0,
                    total_duration_ms: 0,
                });
            entry.count += 1;
            if let Some(ms) = task.actual_duration_ms {
                entry.timed_count += 1;
                entry.total_duration_ms += ms;
            }
        }
        Ok(groups.into_values().collect())
    }

    async fn count_finished_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.session_id == session_id)
            .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
            .filter(|t| t.completed_at.is_some_and(|at| at >= since))
            .count() as u64)
    }

    async fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        let mut removed = 0usize;
        state.tasks.retain(|t| {
            let expired = t.status.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff);
            if expired && removed < limit {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed as u64)
    }
}

#[async_trait]
impl SessionRepository for InMemoryStore {
    async fn create(&self, session: &QueueSession) -> QueueResult<()> {
        self.check_writable()?;
        self.state.lock().unwrap().sessions.push(session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> QueueResult<Option<QueueSession>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned())
    }

    async fn touch(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        counters: SessionCounters,
    ) -> QueueResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id && s.is_active())
        {
            session.last_activity = at;
            session.total_tasks = counters.total_tasks;
            session.completed_tasks = counters.completed_tasks;
            session.failed_tasks = counters.failed_tasks;
        }
        Ok(())
    }

    async fn close(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        status: SessionStatus,
        counters: SessionCounters,
    ) -> QueueResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
        {
            session.ended_at = Some(ended_at);
            session.last_activity = ended_at;
            session.status = status;
            session.total_tasks = counters.total_tasks;
            session.completed_tasks = counters.completed_tasks;
            session.failed_tasks = counters.failed_tasks;
        }
        Ok(())
    }

    async fn list_active(&self) -> QueueResult<Vec<QueueSession>> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.iter().filter(|s| s.is_active()).cloned().collect())
    }

    async fn list_recent(&self, limit: usize) -> QueueResult<Vec<QueueSession>> {
        let state = self.state.lock().unwrap();
        let mut sessions = state.sessions.clone();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn current_summaries(&self) -> QueueResult<Vec<SessionSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.is_active())
            .map(|s| Self::summary_for(s, &state.tasks))
            .collect())
    }

    async fn purge_ended_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        let mut removed = 0usize;
        state.sessions.retain(|s| {
            let expired = !s.is_active() && s.ended_at.is_some_and(|at| at < cutoff);
            if expired && removed < limit {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed as u64)
    }
}

#[async_trait]
impl MetricsRepository for InMemoryStore {
    async fn insert_snapshot(&self, metrics: &QueueMetrics) -> QueueResult<()> {
        self.check_writable()?;
        let mut stored = metrics.clone();
        stored.memory_usage_mb = None;
        let mut state = self.state.lock().unwrap();
        state.metrics.retain(|m| {
            !(m.session_id == stored.session_id && m.snapshot_time == stored.snapshot_time)
        });
        state.metrics.push(stored);
        Ok(())
    }

    async fn latest(&self, session_id: &str) -> QueueResult<Option<QueueMetrics>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .metrics
            .iter()
            .filter(|m| m.session_id == session_id)
            .max_by_key(|m| m.snapshot_time)
            .cloned())
    }

    async fn list_snapshots(&self, session_id: &str, limit: usize) -> QueueResult<Vec<QueueMetrics>> {
        let state = self.state.lock().unwrap();
        let mut snapshots: Vec<QueueMetrics> = state
            .metrics
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.snapshot_time.cmp(&a.snapshot_time));
        snapshots.truncate(limit);
        Ok(snapshots)
    }

    async fn resource_group_performance(&self) -> QueueResult<Vec<ResourceGroupPerformance>> {
        let state = self.state.lock().unwrap();
        let mut per_group: BTreeMap<ResourceGroup, Vec<&QueueTask>> = BTreeMap::new();
        for task in &state.tasks {
            per_group.entry(task.resource_group).or_default().push(task);
        }
        Ok(per_group
            .into_iter()
            .map(|(group, tasks)| {
                let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count() as u64;
                let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count() as u64;
                let durations: Vec<u64> = tasks
                    .iter()
                    .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
                    .filter_map(|t| t.actual_duration_ms)
                    .collect();
                let average_duration_ms = if durations.is_empty() {
                    0.0
                } else {
                    durations.iter().sum::<u64>() as f64 / durations.len() as f64
                };
                ResourceGroupPerformance {
                    resource_group: group,
                    total_tasks: tasks.len() as u64,
                    completed_tasks: completed,
                    failed_tasks: failed,
                    success_rate: success_rate(completed, failed),
                    average_duration_ms,
                }
            })
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        let mut removed = 0usize;
        state.metrics.retain(|m| {
            if m.snapshot_time < cutoff && removed < limit {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed as u64)
    }
}

#[async_trait]
impl HeartbeatRepository for InMemoryStore {
    async fn record(&self, heartbeat: &ProcessHeartbeat) -> QueueResult<()> {
        self.check_writable()?;
        self.state.lock().unwrap().heartbeats.push(heartbeat.clone());
        Ok(())
    }

    async fn latest(&self, session_id: &str) -> QueueResult<Option<ProcessHeartbeat>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .heartbeats
            .iter()
            .filter(|h| h.session_id == session_id)
            .max_by_key(|h| h.timestamp)
            .cloned())
    }

    async fn count_for_session(&self, session_id: &str) -> QueueResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .heartbeats
            .iter()
            .filter(|h| h.session_id == session_id)
            .count() as u64)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        let mut removed = 0usize;
        state.heartbeats.retain(|h| {
            if h.timestamp < cutoff && removed < limit {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed as u64)
    }
}

#[async_trait]
impl CircuitBreakerRepository for InMemoryStore {
    async fn upsert(&self, snapshot: &CircuitBreakerSnapshot) -> QueueResult<()> {
        self.check_writable()?;
        self.state
            .lock()
            .unwrap()
            .breakers
            .insert(snapshot.resource_group, snapshot.clone());
        Ok(())
    }

    async fn load_all(&self) -> QueueResult<Vec<CircuitBreakerSnapshot>> {
        Ok(self.state.lock().unwrap().breakers.values().cloned().collect())
    }
}

/// One scripted outcome for [`ScriptedExecutor`]
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Succeed(serde_json::Value),
    /// Fails with a retryable operation error
    FailRetryable(String),
    /// Fails with a non-retryable error
    FailFatal(String),
    Panic(String),
}

impl ScriptStep {
    fn into_result(self) -> QueueResult<serde_json::Value> {
        match self {
            ScriptStep::Succeed(value) => Ok(value),
            ScriptStep::FailRetryable(msg) => Err(QueueError::operation(msg)),
            ScriptStep::FailFatal(msg) => Err(QueueError::NonRetryable(msg)),
            ScriptStep::Panic(msg) => panic!("{}", msg),
        }
    }
}

/// Executor that replays a script of outcomes and records how it was called
#[derive(Clone)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    fallback: ScriptStep,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback: ScriptStep::Succeed(serde_json::Value::Null),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    pub fn always(step: ScriptStep) -> Self {
        Self::new(Vec::new()).with_fallback(step)
    }

    /// Outcome used once the script is exhausted
    pub fn with_fallback(mut self, step: ScriptStep) -> Self {
        self.fallback = step;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Task ids in the order their attempts started
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, context: &TaskExecutionContext) -> QueueResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(context.task_id.clone());

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(self.running.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        step.into_result()
    }
}

/// In-memory filesystem
#[derive(Clone, Default)]
pub struct MockFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    operations: Arc<AtomicUsize>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.lock().unwrap().insert(path.into(), contents.into());
        self
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystemOperations for MockFileSystem {
    async fn read_file(&self, path: &Path) -> QueueResult<Vec<u8>> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| QueueError::NonRetryable(format!("文件不存在: {}", path.display())))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> QueueResult<u64> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(contents.len() as u64)
    }

    async fn list_directory(&self, path: &Path) -> QueueResult<Vec<DirEntryInfo>> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|(file, _)| file.parent() == Some(path))
            .map(|(file, contents)| DirEntryInfo {
                path: file.clone(),
                is_dir: false,
                size: contents.len() as u64,
            })
            .collect())
    }

    async fn find_files(&self, root: &Path, pattern: &str) -> QueueResult<Vec<PathBuf>> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        let needle = pattern.trim_matches('*');
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|file| file.starts_with(root))
            .filter(|file| {
                file.file_name()
                    .map(|name| name.to_string_lossy().contains(needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// Network double with canned responses and scripted transient failures
#[derive(Clone, Default)]
pub struct MockNetwork {
    responses: Arc<Mutex<HashMap<String, HttpResponse>>>,
    failures_remaining: Arc<Mutex<HashMap<String, usize>>>,
    requests: Arc<AtomicUsize>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            HttpResponse {
                status,
                body: body.into(),
            },
        );
        self
    }

    /// The first `times` requests to `url` fail with a retryable error
    pub fn failing_times(self, url: &str, times: usize) -> Self {
        self.failures_remaining
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn respond(&self, url: &str) -> QueueResult<HttpResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(QueueError::operation(format!("连接被重置: {url}")));
                }
            }
        }
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| QueueError::operation(format!("无法连接: {url}")))
    }
}

#[async_trait]
impl NetworkOperations for MockNetwork {
    async fn fetch(&self, url: &str) -> QueueResult<HttpResponse> {
        self.respond(url)
    }

    async fn post(&self, url: &str, _body: &serde_json::Value) -> QueueResult<HttpResponse> {
        self.respond(url)
    }
}
