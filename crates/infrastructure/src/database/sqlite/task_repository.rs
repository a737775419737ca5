use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskgate_core::{QueueTask, TaskAggregate, TaskRepository, TaskStatus};
use taskgate_errors::{QueueError, QueueResult};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;
use crate::database::SqlitePools;
use crate::error_handling::{EntityKind, RepositoryErrorHelpers, RepositoryOperation};
use crate::repo_context;

const TASK_COLUMNS: &str = "id, session_id, type, resource_group, priority, status, created_at, \
     started_at, completed_at, retry_count, max_retries, last_error, estimated_duration, \
     actual_duration, file_path, file_size, operation_data";

pub struct SqliteTaskRepository {
    pools: SqlitePools,
}

impl SqliteTaskRepository {
    pub fn new(pools: SqlitePools) -> Self {
        Self { pools }
    }

    fn row_to_task(row: &SqliteRow) -> QueueResult<QueueTask> {
        let priority: i64 = row.try_get("priority")?;
        Ok(QueueTask {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            task_type: row.try_get("type")?,
            resource_group: row.try_get("resource_group")?,
            priority: priority.clamp(1, 10) as u8,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: MappingHelpers::get_u32(row, "retry_count")?,
            max_retries: MappingHelpers::get_u32(row, "max_retries")?,
            last_error: row.try_get("last_error")?,
            estimated_duration_ms: MappingHelpers::get_opt_u64(row, "estimated_duration")?,
            actual_duration_ms: MappingHelpers::get_opt_u64(row, "actual_duration")?,
            file_path: row.try_get("file_path")?,
            file_size: MappingHelpers::get_opt_u64(row, "file_size")?,
            operation_data: MappingHelpers::parse_json_value(row, "operation_data")?,
        })
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(
        task_id = %task.id,
        task_type = %task.task_type,
        resource_group = %task.resource_group,
    ))]
    async fn insert(&self, task: &QueueTask) -> QueueResult<()> {
        let context = repo_context!(
            RepositoryOperation::Create,
            EntityKind::Task,
            id = task.id.clone(),
            session = task.session_id.clone()
        );

        let operation_data = serde_json::to_string(&task.operation_data)
            .map_err(|e| RepositoryErrorHelpers::serialization_error(context.clone(), e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO queue_tasks (
                id, session_id, type, resource_group, priority, status, created_at,
                started_at, completed_at, retry_count, max_retries, last_error,
                estimated_duration, actual_duration, file_path, file_size, operation_data
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.session_id)
        .bind(&task.task_type)
        .bind(task.resource_group)
        .bind(task.priority as i64)
        .bind(task.status)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(&task.last_error)
        .bind(MappingHelpers::opt_to_i64(task.estimated_duration_ms))
        .bind(MappingHelpers::opt_to_i64(task.actual_duration_ms))
        .bind(&task.file_path)
        .bind(MappingHelpers::opt_to_i64(task.file_size))
        .bind(operation_data)
        .execute(&self.pools.writer)
        .await;

        match result {
            Ok(_) => {
                debug!("任务已持久化: {}", task.id);
                Ok(())
            }
            Err(e) if RepositoryErrorHelpers::is_unique_violation(&e) => Err(
                QueueError::validation(format!("任务ID已存在: {}", task.id)),
            ),
            Err(e) => Err(RepositoryErrorHelpers::database_error(context, e)),
        }
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: &str) -> QueueResult<Option<QueueTask>> {
        let context = repo_context!(RepositoryOperation::Read, EntityKind::Task, id = id);
        let sql = format!("SELECT {TASK_COLUMNS} FROM queue_tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pools.reader)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn list_by_session(
        &self,
        session_id: &str,
        status: Option<TaskStatus>,
    ) -> QueueResult<Vec<QueueTask>> {
        let context = repo_context!(
            RepositoryOperation::Query,
            EntityKind::Task,
            session = session_id
        );

        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM queue_tasks WHERE session_id = ? AND status = ? \
                     ORDER BY created_at, rowid"
                );
                sqlx::query(&sql)
                    .bind(session_id)
                    .bind(status)
                    .fetch_all(&self.pools.reader)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM queue_tasks WHERE session_id = ? \
                     ORDER BY created_at, rowid"
                );
                sqlx::query(&sql)
                    .bind(session_id)
                    .fetch_all(&self.pools.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn mark_started(&self, id: &str, started_at: DateTime<Utc>) -> QueueResult<bool> {
        let context = repo_context!(RepositoryOperation::Update, EntityKind::Task, id = id)
            .with_additional_info("标记开始执行");
        let result = sqlx::query(
            "UPDATE queue_tasks SET status = 'running', started_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(started_at)
        .bind(id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn mark_completed(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        actual_duration_ms: u64,
    ) -> QueueResult<bool> {
        let context = repo_context!(RepositoryOperation::Update, EntityKind::Task, id = id)
            .with_additional_info("标记完成");
        let result = sqlx::query(
            "UPDATE queue_tasks SET status = 'completed', completed_at = ?, actual_duration = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(completed_at)
        .bind(MappingHelpers::to_i64(actual_duration_ms))
        .bind(id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, last_error))]
    async fn mark_retry(&self, id: &str, retry_count: u32, last_error: &str) -> QueueResult<bool> {
        let context = repo_context!(RepositoryOperation::Update, EntityKind::Task, id = id)
            .with_additional_info(format!("重新入队, 第 {retry_count} 次重试"));
        let result = sqlx::query(
            "UPDATE queue_tasks SET status = 'pending', retry_count = ?, last_error = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(retry_count as i64)
        .bind(last_error)
        .bind(id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, last_error))]
    async fn mark_failed(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
        last_error: &str,
        actual_duration_ms: Option<u64>,
    ) -> QueueResult<bool> {
        let context = repo_context!(RepositoryOperation::Update, EntityKind::Task, id = id)
            .with_additional_info("标记失败");
        let result = sqlx::query(
            "UPDATE queue_tasks SET status = 'failed', completed_at = ?, last_error = ?, \
             actual_duration = COALESCE(?, actual_duration) \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(completed_at)
        .bind(last_error)
        .bind(MappingHelpers::opt_to_i64(actual_duration_ms))
        .bind(id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn cancel_pending_for_session(
        &self,
        session_id: &str,
        cancelled_at: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let context = repo_context!(
            RepositoryOperation::Update,
            EntityKind::Task,
            session = session_id
        )
        .with_additional_info("取消待执行任务");
        let result = sqlx::query(
            "UPDATE queue_tasks SET status = 'cancelled', completed_at = ? \
             WHERE session_id = ? AND status = 'pending'",
        )
        .bind(cancelled_at)
        .bind(session_id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, reason))]
    async fn fail_running_for_session(
        &self,
        session_id: &str,
        failed_at: DateTime<Utc>,
        reason: &str,
    ) -> QueueResult<u64> {
        let context = repo_context!(
            RepositoryOperation::Update,
            EntityKind::Task,
            session = session_id
        )
        .with_additional_info("标记中断的任务失败");
        let result = sqlx::query(
            "UPDATE queue_tasks SET status = 'failed', completed_at = ?, last_error = ? \
             WHERE session_id = ? AND status = 'running'",
        )
        .bind(failed_at)
        .bind(reason)
        .bind(session_id)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn aggregate_by_session(&self, session_id: &str) -> QueueResult<Vec<TaskAggregate>> {
        let context = repo_context!(
            RepositoryOperation::Aggregate,
            EntityKind::Task,
            session = session_id
        );
        let rows = sqlx::query(
            r#"
            SELECT resource_group, status,
                   COUNT(*) AS task_count,
                   COUNT(actual_duration) AS timed_count,
                   COALESCE(SUM(actual_duration), 0) AS total_duration
            FROM queue_tasks
            WHERE session_id = ?
            GROUP BY resource_group, status
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pools.reader)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter()
            .map(|row| {
                Ok(TaskAggregate {
                    resource_group: row.try_get("resource_group")?,
                    status: row.try_get("status")?,
                    count: MappingHelpers::get_u64(row, "task_count")?,
                    timed_count: MappingHelpers::get_u64(row, "timed_count")?,
                    total_duration_ms: MappingHelpers::get_u64(row, "total_duration")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn count_finished_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let context = repo_context!(
            RepositoryOperation::Aggregate,
            EntityKind::Task,
            session = session_id
        );
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_tasks \
             WHERE session_id = ? AND status IN ('completed', 'failed') AND completed_at >= ?",
        )
        .bind(session_id)
        .bind(since)
        .fetch_one(&self.pools.reader)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64> {
        let context = repo_context!(RepositoryOperation::Purge, EntityKind::Task);
        let result = sqlx::query(
            "DELETE FROM queue_tasks WHERE rowid IN ( \
                 SELECT rowid FROM queue_tasks \
                 WHERE status IN ('completed', 'failed', 'cancelled') \
                   AND completed_at IS NOT NULL AND completed_at < ? \
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
