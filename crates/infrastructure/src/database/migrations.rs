use sqlx::SqlitePool;
use taskgate_errors::QueueResult;
use tracing::debug;

use crate::error_handling::{EntityKind, RepositoryErrorHelpers, RepositoryOperation};
use crate::repo_context;

const CREATE_TABLES: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS queue_tasks (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        type TEXT NOT NULL,
        resource_group TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 5 CHECK (priority BETWEEN 1 AND 10),
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
        created_at DATETIME NOT NULL,
        started_at DATETIME,
        completed_at DATETIME,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        last_error TEXT,
        estimated_duration INTEGER,
        actual_duration INTEGER,
        file_path TEXT,
        file_size INTEGER,
        operation_data TEXT NOT NULL DEFAULT 'null'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_metrics (
        session_id TEXT NOT NULL,
        snapshot_time DATETIME NOT NULL,
        total_tasks INTEGER NOT NULL DEFAULT 0,
        pending_tasks INTEGER NOT NULL DEFAULT 0,
        running_tasks INTEGER NOT NULL DEFAULT 0,
        completed_tasks INTEGER NOT NULL DEFAULT 0,
        failed_tasks INTEGER NOT NULL DEFAULT 0,
        cancelled_tasks INTEGER NOT NULL DEFAULT 0,
        success_rate REAL NOT NULL DEFAULT 0,
        average_processing_time REAL NOT NULL DEFAULT 0,
        throughput_per_minute REAL NOT NULL DEFAULT 0,
        resource_group_stats TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (session_id, snapshot_time)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS process_heartbeat (
        process_id INTEGER NOT NULL,
        session_id TEXT NOT NULL,
        timestamp DATETIME NOT NULL,
        memory_used_mb REAL NOT NULL DEFAULT 0,
        memory_total_mb REAL NOT NULL DEFAULT 0,
        uptime_seconds INTEGER NOT NULL DEFAULT 0,
        tasks_processed INTEGER NOT NULL DEFAULT 0,
        tasks_failed INTEGER NOT NULL DEFAULT 0,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        memory_leak_detected INTEGER NOT NULL DEFAULT 0,
        gc_triggered INTEGER NOT NULL DEFAULT 0,
        circuit_breaker_open INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (process_id, timestamp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS circuit_breaker_state (
        resource_group TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'closed'
            CHECK (state IN ('closed', 'open', 'half_open')),
        failure_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        last_failure_time DATETIME,
        last_success_time DATETIME,
        state_changed_at DATETIME NOT NULL,
        failure_threshold INTEGER NOT NULL,
        recovery_timeout_ms INTEGER NOT NULL,
        total_requests INTEGER NOT NULL DEFAULT 0,
        total_failures INTEGER NOT NULL DEFAULT 0,
        failure_rate REAL NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_sessions (
        session_id TEXT PRIMARY KEY,
        created_at DATETIME NOT NULL,
        started_at DATETIME NOT NULL,
        last_activity DATETIME NOT NULL,
        ended_at DATETIME,
        command_line TEXT,
        working_directory TEXT,
        process_id INTEGER NOT NULL,
        total_tasks INTEGER NOT NULL DEFAULT 0,
        completed_tasks INTEGER NOT NULL DEFAULT 0,
        failed_tasks INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'completed', 'orphaned'))
    )
    "#,
];

const CREATE_VIEWS: [&str; 2] = [
    r#"
    CREATE VIEW IF NOT EXISTS current_session_summary AS
    SELECT
        s.session_id,
        s.process_id,
        s.started_at,
        s.last_activity,
        COUNT(t.id) AS total_tasks,
        COALESCE(SUM(CASE WHEN t.status = 'pending' THEN 1 ELSE 0 END), 0) AS pending_tasks,
        COALESCE(SUM(CASE WHEN t.status = 'running' THEN 1 ELSE 0 END), 0) AS running_tasks,
        COALESCE(SUM(CASE WHEN t.status = 'completed' THEN 1 ELSE 0 END), 0) AS completed_tasks,
        COALESCE(SUM(CASE WHEN t.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_tasks,
        COALESCE(SUM(CASE WHEN t.status = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled_tasks,
        CASE
            WHEN COALESCE(SUM(CASE WHEN t.status IN ('completed', 'failed') THEN 1 ELSE 0 END), 0) = 0
                THEN 0.0
            ELSE CAST(SUM(CASE WHEN t.status = 'completed' THEN 1 ELSE 0 END) AS REAL)
                / SUM(CASE WHEN t.status IN ('completed', 'failed') THEN 1 ELSE 0 END)
        END AS success_rate
    FROM queue_sessions s
    LEFT JOIN queue_tasks t ON t.session_id = s.session_id
    WHERE s.status = 'active'
    GROUP BY s.session_id
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS resource_group_performance AS
    SELECT
        resource_group,
        COUNT(*) AS total_tasks,
        SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed_tasks,
        SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed_tasks,
        CASE
            WHEN SUM(CASE WHEN status IN ('completed', 'failed') THEN 1 ELSE 0 END) = 0 THEN 0.0
            ELSE CAST(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS REAL)
                / SUM(CASE WHEN status IN ('completed', 'failed') THEN 1 ELSE 0 END)
        END AS success_rate,
        COALESCE(
            AVG(CASE WHEN status IN ('completed', 'failed') THEN actual_duration END),
            0.0
        ) AS average_duration_ms
    FROM queue_tasks
    GROUP BY resource_group
    "#,
];

const CREATE_INDEXES: [&str; 7] = [
    "CREATE INDEX IF NOT EXISTS idx_queue_tasks_session_status ON queue_tasks(session_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_queue_tasks_status_completed ON queue_tasks(status, completed_at)",
    "CREATE INDEX IF NOT EXISTS idx_queue_tasks_resource_group ON queue_tasks(resource_group)",
    "CREATE INDEX IF NOT EXISTS idx_queue_metrics_snapshot_time ON queue_metrics(snapshot_time)",
    "CREATE INDEX IF NOT EXISTS idx_process_heartbeat_session ON process_heartbeat(session_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_process_heartbeat_timestamp ON process_heartbeat(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_queue_sessions_status ON queue_sessions(status)",
];

/// 建表、建视图、建索引，可重复执行
pub async fn run_migrations(pool: &SqlitePool) -> QueueResult<()> {
    debug!("Running SQLite database migrations");

    let statements = CREATE_TABLES
        .iter()
        .chain(CREATE_VIEWS.iter())
        .chain(CREATE_INDEXES.iter());

    for sql in statements {
        sqlx::query(sql).execute(pool).await.map_err(|e| {
            RepositoryErrorHelpers::database_error(
                repo_context!(RepositoryOperation::Migrate, EntityKind::Schema),
                e,
            )
        })?;
    }

    debug!("Successfully completed SQLite database migrations");
    Ok(())
}
