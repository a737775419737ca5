use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use taskgate_core::config::{CleanupConfig, DatabaseConfig};
use taskgate_core::{
    CircuitBreaker, CircuitBreakerConfig, ManualClock, Permit, ProcessHeartbeat, QueueMetrics,
    QueueRepositories, QueueSession, QueueTask, ResourceGroup, SessionCounters, SessionStatus,
    TaskRequest, TaskStatus,
};
use taskgate_errors::QueueError;
use taskgate_infrastructure::{CleanupService, DatabaseManager};
use tempfile::TempDir;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

async fn open_store(dir: &TempDir) -> Result<(DatabaseManager, QueueRepositories)> {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("queue.db").display()),
        ..DatabaseConfig::default()
    };
    let manager = DatabaseManager::connect(&config).await?;
    let repositories = manager.repositories();
    Ok((manager, repositories))
}

fn task(id: &str, session: &str, task_type: &str, now: DateTime<Utc>) -> QueueTask {
    TaskRequest::new(task_type)
        .with_id(id)
        .with_session(session)
        .into_task(session, 3, now)
}

#[tokio::test]
async fn test_task_round_trip_and_guarded_transitions() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repos) = open_store(&dir).await?;
    let now = base_time();

    let mut original = task("t-1", "s-1", "file_read", now);
    original.priority = 2;
    original.file_path = Some("/tmp/input.txt".to_string());
    original.file_size = Some(4096);
    original.estimated_duration_ms = Some(250);
    original.operation_data = json!({"path": "/tmp/input.txt", "encoding": "utf-8"});
    repos.tasks.insert(&original).await?;

    let loaded = repos.tasks.get_by_id("t-1").await?.expect("task exists");
    assert_eq!(loaded, original);
    assert_eq!(loaded.resource_group, ResourceGroup::Filesystem);

    // 只有 pending 任务可以开始
    assert!(repos.tasks.mark_started("t-1", now).await?);
    assert!(!repos.tasks.mark_started("t-1", now).await?);

    assert!(repos.tasks.mark_retry("t-1", 1, "disk busy").await?);
    let retried = repos.tasks.get_by_id("t-1").await?.expect("task exists");
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.last_error.as_deref(), Some("disk busy"));

    assert!(repos.tasks.mark_started("t-1", now).await?);
    let done_at = now + Duration::milliseconds(120);
    assert!(repos.tasks.mark_completed("t-1", done_at, 120).await?);
    assert!(!repos.tasks.mark_completed("t-1", done_at, 120).await?);
    assert!(!repos.tasks.mark_failed("t-1", done_at, "late", None).await?);

    let completed = repos.tasks.get_by_id("t-1").await?.expect("task exists");
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.completed_at, Some(done_at));
    assert_eq!(completed.actual_duration_ms, Some(120));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_task_id_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repos) = open_store(&dir).await?;

    repos.tasks.insert(&task("dup", "s-1", "compute", base_time())).await?;
    let err = repos
        .tasks
        .insert(&task("dup", "s-1", "compute", base_time()))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn test_cancel_pending_leaves_running_untouched() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repos) = open_store(&dir).await?;
    let now = base_time();

    for id in ["a", "b", "c"] {
        repos.tasks.insert(&task(id, "s-1", "http_fetch", now)).await?;
    }
    repos.tasks.insert(&task("other", "s-2", "http_fetch", now)).await?;
    repos.tasks.mark_started("a", now).await?;

    let cancelled = repos.tasks.cancel_pending_for_session("s-1", now).await?;
    assert_eq!(cancelled, 2);

    let running = repos
        .tasks
        .list_by_session("s-1", Some(TaskStatus::Running))
        .await?;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, "a");

    let other = repos.tasks.get_by_id("other").await?.expect("task exists");
    assert_eq!(other.status, TaskStatus::Pending);

    // 被取消的任务不能再开始
    assert!(!repos.tasks.mark_started("b", now).await?);

    let failed = repos
        .tasks
        .fail_running_for_session("s-1", now, "process exited")
        .await?;
    assert_eq!(failed, 1);
    Ok(())
}

#[tokio::test]
async fn test_aggregates_views_and_metrics_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repos) = open_store(&dir).await?;
    let now = base_time();

    let session = QueueSession::new("s-1".to_string(), std::process::id(), now);
    repos.sessions.create(&session).await?;

    for (id, task_type) in [("f1", "file_read"), ("f2", "file_write"), ("n1", "http_fetch")] {
        repos.tasks.insert(&task(id, "s-1", task_type, now)).await?;
        repos.tasks.mark_started(id, now).await?;
    }
    repos.tasks.insert(&task("p1", "s-1", "file_read", now)).await?;

    let finished = now + Duration::seconds(1);
    repos.tasks.mark_completed("f1", finished, 100).await?;
    repos.tasks.mark_failed("f2", finished, "denied", Some(300)).await?;
    repos.tasks.mark_completed("n1", finished, 1000).await?;

    let aggregates = repos.tasks.aggregate_by_session("s-1").await?;
    let recent = repos
        .tasks
        .count_finished_since("s-1", finished - Duration::seconds(60))
        .await?;
    assert_eq!(recent, 3);

    let metrics = QueueMetrics::from_aggregates("s-1", finished, &aggregates, recent);
    assert_eq!(metrics.total_tasks, 4);
    assert_eq!(metrics.pending_tasks, 1);
    assert_eq!(metrics.completed_tasks, 2);
    assert_eq!(metrics.failed_tasks, 1);
    assert!((metrics.average_processing_time_ms - 1400.0 / 3.0).abs() < 1e-9);

    repos.metrics.insert_snapshot(&metrics).await?;
    let latest = repos.metrics.latest("s-1").await?.expect("snapshot");
    assert_eq!(latest.total_tasks, 4);
    assert_eq!(latest.resource_group_stats, metrics.resource_group_stats);

    let summaries = repos.sessions.current_summaries().await?;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_tasks, 4);
    assert_eq!(summaries[0].pending_tasks, 1);
    assert!((summaries[0].success_rate - 2.0 / 3.0).abs() < 1e-9);

    let performance = repos.metrics.resource_group_performance().await?;
    let filesystem = performance
        .iter()
        .find(|p| p.resource_group == ResourceGroup::Filesystem)
        .expect("filesystem row");
    assert_eq!(filesystem.total_tasks, 3);
    assert_eq!(filesystem.completed_tasks, 1);
    assert_eq!(filesystem.failed_tasks, 1);
    assert!((filesystem.success_rate - 0.5).abs() < 1e-9);
    assert!((filesystem.average_duration_ms - 200.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_session_lifecycle() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repos) = open_store(&dir).await?;
    let now = base_time();

    let mut session = QueueSession::new("s-1".to_string(), 4242, now);
    session.command_line = Some("taskgate read a.txt".to_string());
    repos.sessions.create(&session).await?;

    let counters = SessionCounters {
        total_tasks: 5,
        completed_tasks: 3,
        failed_tasks: 1,
    };
    repos
        .sessions
        .touch("s-1", now + Duration::seconds(5), counters)
        .await?;
    let touched = repos.sessions.get("s-1").await?.expect("session");
    assert_eq!(touched.last_activity, now + Duration::seconds(5));
    assert_eq!(touched.completed_tasks, 3);
    assert_eq!(repos.sessions.list_active().await?.len(), 1);

    repos
        .sessions
        .close("s-1", now + Duration::seconds(10), SessionStatus::Completed, counters)
        .await?;
    let closed = repos.sessions.get("s-1").await?.expect("session");
    assert_eq!(closed.status, SessionStatus::Completed);
    assert_eq!(closed.ended_at, Some(now + Duration::seconds(10)));
    assert!(repos.sessions.list_active().await?.is_empty());
    assert!(repos.sessions.current_summaries().await?.is_empty());
    assert_eq!(repos.sessions.list_recent(10).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_heartbeats_and_circuit_breaker_state() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repos) = open_store(&dir).await?;
    let now = base_time();

    for offset in 0..3 {
        let heartbeat = ProcessHeartbeat {
            process_id: 4242,
            session_id: "s-1".to_string(),
            timestamp: now + Duration::seconds(offset * 30),
            memory_used_mb: 40.0 + offset as f64,
            memory_total_mb: 16384.0,
            uptime_seconds: (offset * 30) as u64,
            tasks_processed: offset as u64,
            tasks_failed: 0,
            consecutive_failures: 0,
            memory_leak_detected: false,
            gc_triggered: false,
            circuit_breaker_open: offset == 2,
        };
        repos.heartbeats.record(&heartbeat).await?;
    }
    assert_eq!(repos.heartbeats.count_for_session("s-1").await?, 3);
    let latest = repos.heartbeats.latest("s-1").await?.expect("heartbeat");
    assert_eq!(latest.memory_used_mb, 42.0);
    assert!(latest.circuit_breaker_open);

    let purged = repos
        .heartbeats
        .purge_before(now + Duration::seconds(45), 100)
        .await?;
    assert_eq!(purged, 2);

    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        ..CircuitBreakerConfig::default()
    };
    let mut breaker = CircuitBreaker::new(ResourceGroup::Network, config.clone(), now);
    repos.circuit_breakers.upsert(&breaker.snapshot("s-1")).await?;
    breaker.record_failure(Permit::Normal, now);
    breaker.record_failure(Permit::Normal, now);
    repos.circuit_breakers.upsert(&breaker.snapshot("s-1")).await?;

    let stored = repos.circuit_breakers.load_all().await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0], breaker.snapshot("s-1"));

    let restored = CircuitBreaker::restore(&stored[0], config);
    assert_eq!(restored.current_state(), breaker.current_state());
    Ok(())
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_finished_rows() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repos) = open_store(&dir).await?;
    let old = base_time() - Duration::days(30);
    let now = base_time();

    repos.tasks.insert(&task("old-done", "s-0", "compute", old)).await?;
    repos.tasks.mark_started("old-done", old).await?;
    repos.tasks.mark_completed("old-done", old, 5).await?;
    repos.tasks.insert(&task("old-pending", "s-0", "compute", old)).await?;
    repos.tasks.insert(&task("fresh-done", "s-1", "compute", now)).await?;
    repos.tasks.mark_started("fresh-done", now).await?;
    repos.tasks.mark_completed("fresh-done", now, 5).await?;

    let clock = Arc::new(ManualClock::new(now));
    let config = CleanupConfig {
        batch_size: 1,
        ..CleanupConfig::default()
    };
    let service = CleanupService::new(repos.clone(), config, clock);
    let stats = service.cleanup_once().await?;

    assert_eq!(stats.tasks_cleaned, 1);
    assert!(repos.tasks.get_by_id("old-done").await?.is_none());
    assert!(repos.tasks.get_by_id("old-pending").await?.is_some());
    assert!(repos.tasks.get_by_id("fresh-done").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_state_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let (manager, repos) = open_store(&dir).await?;
        repos.tasks.insert(&task("keep", "s-1", "file_read", base_time())).await?;
        manager.close().await;
    }

    let (_manager, repos) = open_store(&dir).await?;
    let reloaded = repos.tasks.get_by_id("keep").await?.expect("persisted task");
    assert_eq!(reloaded.status, TaskStatus::Pending);
    Ok(())
}
