//! 持久化仓储抽象
//!
//! 队列引擎只依赖这些接口，SQLite 实现位于 infrastructure crate，测试使用内存实现。
//! 所有写操作都需要串行化（单写者），读操作可以与调度并发进行。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::circuit_breaker::CircuitBreakerSnapshot;
use crate::models::{
    ProcessHeartbeat, QueueMetrics, QueueSession, QueueTask, ResourceGroupPerformance,
    SessionCounters, SessionStatus, SessionSummary, TaskAggregate, TaskStatus,
};
use crate::QueueResult;

/// 任务仓储
///
/// 状态迁移方法都带有条件保护，只会修改处于预期状态的行，
/// 返回值用于判断迁移是否真的发生。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &QueueTask) -> QueueResult<()>;
    async fn get_by_id(&self, id: &str) -> QueueResult<Option<QueueTask>>;
    async fn list_by_session(
        &self,
        session_id: &str,
        status: Option<TaskStatus>,
    ) -> QueueResult<Vec<QueueTask>>;
    /// pending -> running，任务已被取消时返回 false
    async fn mark_started(&self, id: &str, started_at: DateTime<Utc>) -> QueueResult<bool>;
    async fn mark_completed(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        actual_duration_ms: u64,
    ) -> QueueResult<bool>;
    /// running -> pending，记录新的重试次数和错误
    async fn mark_retry(&self, id: &str, retry_count: u32, last_error: &str) -> QueueResult<bool>;
    /// pending/running -> failed
    async fn mark_failed(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        last_error: &str,
        actual_duration_ms: Option<u64>,
    ) -> QueueResult<bool>;
    /// 会话内所有 pending 任务 -> cancelled，返回受影响行数
    async fn cancel_pending_for_session(
        &self,
        session_id: &str,
        cancelled_at: DateTime<Utc>,
    ) -> QueueResult<u64>;
    /// 会话内所有 running 任务 -> failed，用于回收崩溃会话
    async fn fail_running_for_session(
        &self,
        session_id: &str,
        failed_at: DateTime<Utc>,
        reason: &str,
    ) -> QueueResult<u64>;
    async fn aggregate_by_session(&self, session_id: &str) -> QueueResult<Vec<TaskAggregate>>;
    /// 指定时间之后结束（completed/failed）的任务数
    async fn count_finished_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> QueueResult<u64>;
    /// 删除结束时间早于 cutoff 的终态任务，最多删除 limit 行
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: usize)
        -> QueueResult<u64>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &QueueSession) -> QueueResult<()>;
    async fn get(&self, session_id: &str) -> QueueResult<Option<QueueSession>>;
    async fn touch(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        counters: SessionCounters,
    ) -> QueueResult<()>;
    async fn close(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        status: SessionStatus,
        counters: SessionCounters,
    ) -> QueueResult<()>;
    async fn list_active(&self) -> QueueResult<Vec<QueueSession>>;
    async fn list_recent(&self, limit: usize) -> QueueResult<Vec<QueueSession>>;
    /// 读取 `current_session_summary` 视图
    async fn current_summaries(&self) -> QueueResult<Vec<SessionSummary>>;
    async fn purge_ended_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64>;
}

#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn insert_snapshot(&self, metrics: &QueueMetrics) -> QueueResult<()>;
    async fn latest(&self, session_id: &str) -> QueueResult<Option<QueueMetrics>>;
    async fn list_snapshots(&self, session_id: &str, limit: usize) -> QueueResult<Vec<QueueMetrics>>;
    /// 读取 `resource_group_performance` 视图
    async fn resource_group_performance(&self) -> QueueResult<Vec<ResourceGroupPerformance>>;
    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64>;
}

#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    async fn record(&self, heartbeat: &ProcessHeartbeat) -> QueueResult<()>;
    async fn latest(&self, session_id: &str) -> QueueResult<Option<ProcessHeartbeat>>;
    async fn count_for_session(&self, session_id: &str) -> QueueResult<u64>;
    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64>;
}

#[async_trait]
pub trait CircuitBreakerRepository: Send + Sync {
    /// 每个资源组只保留最新状态
    async fn upsert(&self, snapshot: &CircuitBreakerSnapshot) -> QueueResult<()>;
    async fn load_all(&self) -> QueueResult<Vec<CircuitBreakerSnapshot>>;
}

/// 引擎需要的全部仓储，通过构造函数注入
#[derive(Clone)]
pub struct QueueRepositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub metrics: Arc<dyn MetricsRepository>,
    pub heartbeats: Arc<dyn HeartbeatRepository>,
    pub circuit_breakers: Arc<dyn CircuitBreakerRepository>,
}
