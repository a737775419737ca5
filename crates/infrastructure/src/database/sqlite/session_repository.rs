use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskgate_core::{QueueSession, SessionCounters, SessionRepository, SessionStatus, SessionSummary};
use taskgate_errors::QueueResult;
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;
use crate::database::SqlitePools;
use crate::error_handling::{EntityKind, RepositoryErrorHelpers, RepositoryOperation};
use crate::repo_context;

const SESSION_COLUMNS: &str = "session_id, created_at, started_at, last_activity, ended_at, \
     command_line, working_directory, process_id, total_tasks, completed_tasks, failed_tasks, status";

pub struct SqliteSessionRepository {
    pools: SqlitePools,
}

impl SqliteSessionRepository {
    pub fn new(pools: SqlitePools) -> Self {
        Self { pools }
    }

    fn row_to_session(row: &SqliteRow) -> QueueResult<QueueSession> {
        Ok(QueueSession {
            session_id: row.try_get("session_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            last_activity: row.try_get("last_activity")?,
            ended_at: row.try_get("ended_at")?,
            command_line: row.try_get("command_line")?,
            working_directory: row.try_get("working_directory")?,
            process_id: MappingHelpers::get_u32(row, "process_id")?,
            total_tasks: MappingHelpers::get_u64(row, "total_tasks")?,
            completed_tasks: MappingHelpers::get_u64(row, "completed_tasks")?,
            failed_tasks: MappingHelpers::get_u64(row, "failed_tasks")?,
            status: row.try_get("status")?,
        })
    }

    fn row_to_summary(row: &SqliteRow) -> QueueResult<SessionSummary> {
        Ok(SessionSummary {
            session_id: row.try_get("session_id")?,
            process_id: MappingHelpers::get_u32(row, "process_id")?,
            started_at: row.try_get("started_at")?,
            last_activity: row.try_get("last_activity")?,
            total_tasks: MappingHelpers::get_u64(row, "total_tasks")?,
            pending_tasks: MappingHelpers::get_u64(row, "pending_tasks")?,
            running_tasks: MappingHelpers::get_u64(row, "running_tasks")?,
            completed_tasks: MappingHelpers::get_u64(row, "completed_tasks")?,
            failed_tasks: MappingHelpers::get_u64(row, "failed_tasks")?,
            cancelled_tasks: MappingHelpers::get_u64(row, "cancelled_tasks")?,
            success_rate: row.try_get("success_rate")?,
        })
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    async fn create(&self, session: &QueueSession) -> QueueResult<()> {
        let context = repo_context!(
            RepositoryOperation::Create,
            EntityKind::Session,
            id = session.session_id.clone()
        );
        sqlx::query(
            r#"
            INSERT INTO queue_sessions (
                session_id, created_at, started_at, last_activity, ended_at, command_line,
                working_directory, process_id, total_tasks, completed_tasks, failed_tasks, status
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.last_activity)
        .bind(session.ended_at)
        .bind(&session.command_line)
        .bind(&session.working_directory)
        .bind(session.process_id as i64)
        .bind(MappingHelpers::to_i64(session.total_tasks))
        .bind(MappingHelpers::to_i64(session.completed_tasks))
        .bind(MappingHelpers::to_i64(session.failed_tasks))
        .bind(session.status)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        debug!("会话已创建: {}", session.session_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, session_id: &str) -> QueueResult<Option<QueueSession>> {
        let context = repo_context!(RepositoryOperation::Read, EntityKind::Session, id = session_id);
        let sql = format!("SELECT {SESSION_COLUMNS} FROM queue_sessions WHERE session_id = ?");
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pools.reader)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_session).transpose()
    }

    #[instrument(skip(self, counters))]
    async fn touch(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        counters: SessionCounters,
    ) -> QueueResult<()> {
        let context =
            repo_context!(RepositoryOperation::Update, EntityKind::Session, id = session_id)
                .with_additional_info("刷新活跃时间");
        sqlx::query(
            "UPDATE queue_sessions SET last_activity = ?, total_tasks = ?, completed_tasks = ?, \
             failed_tasks = ? WHERE session_id = ? AND status = 'active'",
        )
        .bind(at)
        .bind(MappingHelpers::to_i64(counters.total_tasks))
        .bind(MappingHelpers::to_i64(counters.completed_tasks))
        .bind(MappingHelpers::to_i64(counters.failed_tasks))
        .bind(session_id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(())
    }

    #[instrument(skip(self, counters))]
    async fn close(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        status: SessionStatus,
        counters: SessionCounters,
    ) -> QueueResult<()> {
        let context =
            repo_context!(RepositoryOperation::Update, EntityKind::Session, id = session_id)
                .with_additional_info(format!("结束会话: {status}"));
        sqlx::query(
            "UPDATE queue_sessions SET ended_at = ?, last_activity = ?, status = ?, \
             total_tasks = ?, completed_tasks = ?, failed_tasks = ? WHERE session_id = ?",
        )
        .bind(ended_at)
        .bind(ended_at)
        .bind(status)
        .bind(MappingHelpers::to_i64(counters.total_tasks))
        .bind(MappingHelpers::to_i64(counters.completed_tasks))
        .bind(MappingHelpers::to_i64(counters.failed_tasks))
        .bind(session_id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> QueueResult<Vec<QueueSession>> {
        let context = repo_context!(RepositoryOperation::Query, EntityKind::Session)
            .with_additional_info("活跃会话");
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM queue_sessions WHERE status = 'active' ORDER BY started_at"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pools.reader)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_session).collect()
    }

    #[instrument(skip(self))]
    async fn list_recent(&self, limit: usize) -> QueueResult<Vec<QueueSession>> {
        let context = repo_context!(RepositoryOperation::Query, EntityKind::Session);
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM queue_sessions ORDER BY started_at DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pools.reader)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_session).collect()
    }

    #[instrument(skip(self))]
    async fn current_summaries(&self) -> QueueResult<Vec<SessionSummary>> {
        let context = repo_context!(RepositoryOperation::Aggregate, EntityKind::Session)
            .with_additional_info("current_session_summary");
        let rows = sqlx::query(
            "SELECT session_id, process_id, started_at, last_activity, total_tasks, pending_tasks, \
             running_tasks, completed_tasks, failed_tasks, cancelled_tasks, success_rate \
             FROM current_session_summary ORDER BY started_at",
        )
        .fetch_all(&self.pools.reader)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_summary).collect()
    }

    #[instrument(skip(self))]
    async fn purge_ended_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64> {
        let context = repo_context!(RepositoryOperation::Purge, EntityKind::Session);
        let result = sqlx::query(
            "DELETE FROM queue_sessions WHERE rowid IN ( \
                 SELECT rowid FROM queue_sessions \
                 WHERE status != 'active' AND ended_at IS NOT NULL AND ended_at < ? \
                 LIMIT ?)",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected())
    }
}
