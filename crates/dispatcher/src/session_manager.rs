use std::sync::Arc;

use chrono::Duration;
use taskgate_core::config::QueueConfig;
use taskgate_core::{Clock, QueueRepositories, QueueSession, SessionCounters, SessionStatus};
use taskgate_errors::QueueResult;
use taskgate_infrastructure::process_alive;
use tracing::{debug, info, warn};

/// 会话生命周期管理
///
/// 每次进程运行对应一个会话。启动时回收崩溃进程遗留的活跃会话，
/// 运行中由心跳刷新活动时间，正常退出时关闭会话。
pub struct SessionManager {
    repositories: QueueRepositories,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    heartbeat_enabled: bool,
}

impl SessionManager {
    pub fn new(repositories: QueueRepositories, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            repositories,
            clock,
            config,
            heartbeat_enabled: false,
        }
    }

    /// 心跳开启时活动时间会被定期刷新，长时间未刷新的存活 pid 视为被其他进程复用
    pub fn with_heartbeats(mut self, enabled: bool) -> Self {
        self.heartbeat_enabled = enabled;
        self
    }

    /// 创建当前进程的活跃会话
    pub async fn open(&self, session_id: &str) -> QueueResult<QueueSession> {
        let mut session =
            QueueSession::new(session_id.to_string(), std::process::id(), self.clock.now());
        session.command_line = Some(std::env::args().collect::<Vec<_>>().join(" "));
        session.working_directory = std::env::current_dir()
            .ok()
            .map(|dir| dir.display().to_string());

        self.repositories.sessions.create(&session).await?;
        info!("会话 {} 已创建 (pid {})", session.session_id, session.process_id);
        Ok(session)
    }

    /// 查找遗留会话
    ///
    /// 进程已不存在的其他活跃会话视为遗留。进程存活时只有开启了心跳、
    /// 且活动时间超过 `orphan_stale_after_seconds` 才视为 pid 被复用。
    pub async fn find_orphans(&self, current_session_id: &str) -> QueueResult<Vec<QueueSession>> {
        let now = self.clock.now();
        let stale_after = Duration::seconds(self.config.orphan_stale_after_seconds as i64);
        let mut orphans = Vec::new();

        for session in self.repositories.sessions.list_active().await? {
            if session.session_id == current_session_id {
                continue;
            }

            let alive = process_alive(session.process_id);
            let stale = now - session.last_activity > stale_after;
            if alive && !(self.heartbeat_enabled && stale) {
                debug!(
                    "会话 {} 仍然活跃 (pid {}), 跳过回收",
                    session.session_id, session.process_id
                );
                continue;
            }
            orphans.push(session);
        }

        Ok(orphans)
    }

    /// 关闭遗留会话: 崩溃时仍在运行的任务标记为失败，会话状态置为 orphaned
    ///
    /// 待执行任务应当先通过队列引擎取消。
    pub async fn retire_orphan(&self, session: &QueueSession, cancelled: u64) -> QueueResult<()> {
        let now = self.clock.now();
        let interrupted = self
            .repositories
            .tasks
            .fail_running_for_session(
                &session.session_id,
                now,
                &format!("进程 {} 异常退出, 任务被中断", session.process_id),
            )
            .await?;

        let counters = SessionCounters {
            total_tasks: session.total_tasks,
            completed_tasks: session.completed_tasks,
            failed_tasks: session.failed_tasks + interrupted,
        };
        self.repositories
            .sessions
            .close(&session.session_id, now, SessionStatus::Orphaned, counters)
            .await?;

        warn!(
            "回收遗留会话 {} (pid {}): 取消 {} 个待执行任务, {} 个运行中任务标记为失败",
            session.session_id, session.process_id, cancelled, interrupted
        );
        Ok(())
    }

    pub async fn touch(&self, session_id: &str, counters: SessionCounters) -> QueueResult<()> {
        self.repositories
            .sessions
            .touch(session_id, self.clock.now(), counters)
            .await
    }

    pub async fn close(&self, session_id: &str, counters: SessionCounters) -> QueueResult<()> {
        self.repositories
            .sessions
            .close(session_id, self.clock.now(), SessionStatus::Completed, counters)
            .await?;
        info!(
            "会话 {} 已关闭: 共 {} 个任务, 完成 {}, 失败 {}",
            session_id, counters.total_tasks, counters.completed_tasks, counters.failed_tasks
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_core::{ManualClock, TaskStatus};
    use taskgate_testing_utils::{InMemoryStore, QueueTaskBuilder, SessionBuilder};

    fn manager(store: &InMemoryStore, clock: &ManualClock) -> SessionManager {
        SessionManager::new(
            store.repositories(),
            Arc::new(clock.clone()),
            QueueConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_open_records_process() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let session = manager(&store, &clock).open("s-1").await.unwrap();

        assert_eq!(session.process_id, std::process::id());
        assert!(session.command_line.is_some());
        assert!(session.working_directory.is_some());
        assert_eq!(store.sessions().len(), 1);
        assert!(store.sessions()[0].is_active());
    }

    /// 当前进程 pid 下一个长时间无活动的会话，带一个运行中的任务
    async fn stale_live_session(store: &InMemoryStore, clock: &ManualClock) {
        let repos = store.repositories();
        let session = SessionBuilder::new("busy")
            .last_active_at(clock.now() - Duration::hours(1))
            .build();
        repos.sessions.create(&session).await.unwrap();
        repos
            .tasks
            .insert(
                &QueueTaskBuilder::new("long-job")
                    .with_session("busy")
                    .running_since(clock.now() - Duration::hours(1))
                    .build(),
            )
            .await
            .unwrap();
    }

    /// 没有心跳刷新时，长时间无活动的存活进程仍然保留它的会话和运行中任务
    #[tokio::test]
    async fn test_live_session_kept_without_heartbeats() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        stale_live_session(&store, &clock).await;

        let orphans = manager(&store, &clock).find_orphans("current").await.unwrap();
        assert!(orphans.is_empty());

        assert_eq!(store.task("long-job").unwrap().status, TaskStatus::Running);
        let busy = store.repositories().sessions.get("busy").await.unwrap().unwrap();
        assert!(busy.is_active());
    }

    /// 开启心跳后长时间未刷新的存活 pid 视为被复用
    #[tokio::test]
    async fn test_stale_session_reclaimed_with_heartbeats() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let repos = store.repositories();
        stale_live_session(&store, &clock).await;

        let manager = manager(&store, &clock).with_heartbeats(true);
        manager.open("current").await.unwrap();
        let orphans = manager.find_orphans("current").await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].session_id, "busy");

        manager.retire_orphan(&orphans[0], 0).await.unwrap();
        let interrupted = store.task("long-job").unwrap();
        assert_eq!(interrupted.status, TaskStatus::Failed);
        assert!(interrupted.last_error.unwrap().contains("中断"));

        let busy = repos.sessions.get("busy").await.unwrap().unwrap();
        assert_eq!(busy.status, SessionStatus::Orphaned);
        assert_eq!(busy.failed_tasks, 1);
        assert!(busy.ended_at.is_some());
        assert!(repos.sessions.get("current").await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_live_recent_session_is_kept() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let repos = store.repositories();

        let neighbour = SessionBuilder::new("neighbour")
            .last_active_at(clock.now())
            .build();
        repos.sessions.create(&neighbour).await.unwrap();

        let orphans = manager(&store, &clock)
            .with_heartbeats(true)
            .find_orphans("current")
            .await
            .unwrap();
        assert!(orphans.is_empty());
        assert!(repos.sessions.get("neighbour").await.unwrap().unwrap().is_active());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dead_process_session_is_orphaned() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let repos = store.repositories();

        // 超过 pid_max 的进程号不可能存在
        let crashed = SessionBuilder::new("crashed")
            .with_process_id(u32::MAX - 1)
            .last_active_at(clock.now())
            .build();
        repos.sessions.create(&crashed).await.unwrap();

        let orphans = manager(&store, &clock).find_orphans("current").await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].session_id, "crashed");
    }
}
