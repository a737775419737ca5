use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskgate_core::{HeartbeatRepository, ProcessHeartbeat};
use taskgate_errors::QueueResult;
use tracing::instrument;

use crate::database::mapping::MappingHelpers;
use crate::database::SqlitePools;
use crate::error_handling::{EntityKind, RepositoryErrorHelpers, RepositoryOperation};
use crate::repo_context;

pub struct SqliteHeartbeatRepository {
    pools: SqlitePools,
}

impl SqliteHeartbeatRepository {
    pub fn new(pools: SqlitePools) -> Self {
        Self { pools }
    }

    fn row_to_heartbeat(row: &SqliteRow) -> QueueResult<ProcessHeartbeat> {
        Ok(ProcessHeartbeat {
            process_id: MappingHelpers::get_u32(row, "process_id")?,
            session_id: row.try_get("session_id")?,
            timestamp: row.try_get("timestamp")?,
            memory_used_mb: row.try_get("memory_used_mb")?,
            memory_total_mb: row.try_get("memory_total_mb")?,
            uptime_seconds: MappingHelpers::get_u64(row, "uptime_seconds")?,
            tasks_processed: MappingHelpers::get_u64(row, "tasks_processed")?,
            tasks_failed: MappingHelpers::get_u64(row, "tasks_failed")?,
            consecutive_failures: MappingHelpers::get_u64(row, "consecutive_failures")?,
            memory_leak_detected: MappingHelpers::get_bool(row, "memory_leak_detected")?,
            gc_triggered: MappingHelpers::get_bool(row, "gc_triggered")?,
            circuit_breaker_open: MappingHelpers::get_bool(row, "circuit_breaker_open")?,
        })
    }
}

#[async_trait]
impl HeartbeatRepository for SqliteHeartbeatRepository {
    #[instrument(skip(self, heartbeat), fields(process_id = heartbeat.process_id))]
    async fn record(&self, heartbeat: &ProcessHeartbeat) -> QueueResult<()> {
        let context = repo_context!(
            RepositoryOperation::Create,
            EntityKind::Heartbeat,
            session = heartbeat.session_id.clone()
        );
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO process_heartbeat (
                process_id, session_id, timestamp, memory_used_mb, memory_total_mb,
                uptime_seconds, tasks_processed, tasks_failed, consecutive_failures,
                memory_leak_detected, gc_triggered, circuit_breaker_open
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(heartbeat.process_id as i64)
        .bind(&heartbeat.session_id)
        .bind(heartbeat.timestamp)
        .bind(heartbeat.memory_used_mb)
        .bind(heartbeat.memory_total_mb)
        .bind(MappingHelpers::to_i64(heartbeat.uptime_seconds))
        .bind(MappingHelpers::to_i64(heartbeat.tasks_processed))
        .bind(MappingHelpers::to_i64(heartbeat.tasks_failed))
        .bind(MappingHelpers::to_i64(heartbeat.consecutive_failures))
        .bind(heartbeat.memory_leak_detected as i64)
        .bind(heartbeat.gc_triggered as i64)
        .bind(heartbeat.circuit_breaker_open as i64)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest(&self, session_id: &str) -> QueueResult<Option<ProcessHeartbeat>> {
        let context = repo_context!(
            RepositoryOperation::Read,
            EntityKind::Heartbeat,
            session = session_id
        );
        let row = sqlx::query(
            "SELECT process_id, session_id, timestamp, memory_used_mb, memory_total_mb, \
             uptime_seconds, tasks_processed, tasks_failed, consecutive_failures, \
             memory_leak_detected, gc_triggered, circuit_breaker_open \
             FROM process_heartbeat WHERE session_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pools.reader)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_heartbeat).transpose()
    }

    #[instrument(skip(self))]
    async fn count_for_session(&self, session_id: &str) -> QueueResult<u64> {
        let context = repo_context!(
            RepositoryOperation::Aggregate,
            EntityKind::Heartbeat,
            session = session_id
        );
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM process_heartbeat WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pools.reader)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64> {
        let context = repo_context!(RepositoryOperation::Purge, EntityKind::Heartbeat);
        let result = sqlx::query(
            "DELETE FROM process_heartbeat WHERE rowid IN ( \
                 SELECT rowid FROM process_heartbeat WHERE timestamp < ? LIMIT ?)",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected())
    }
}
