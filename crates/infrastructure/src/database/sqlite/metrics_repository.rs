use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskgate_core::{MetricsRepository, QueueMetrics, ResourceGroupPerformance};
use taskgate_errors::QueueResult;
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;
use crate::database::SqlitePools;
use crate::error_handling::{EntityKind, RepositoryErrorHelpers, RepositoryOperation};
use crate::repo_context;

const METRICS_COLUMNS: &str = "session_id, snapshot_time, total_tasks, pending_tasks, \
     running_tasks, completed_tasks, failed_tasks, cancelled_tasks, success_rate, \
     average_processing_time, throughput_per_minute, resource_group_stats";

pub struct SqliteMetricsRepository {
    pools: SqlitePools,
}

impl SqliteMetricsRepository {
    pub fn new(pools: SqlitePools) -> Self {
        Self { pools }
    }

    fn row_to_metrics(row: &SqliteRow) -> QueueResult<QueueMetrics> {
        Ok(QueueMetrics {
            session_id: row.try_get("session_id")?,
            snapshot_time: row.try_get("snapshot_time")?,
            total_tasks: MappingHelpers::get_u64(row, "total_tasks")?,
            pending_tasks: MappingHelpers::get_u64(row, "pending_tasks")?,
            running_tasks: MappingHelpers::get_u64(row, "running_tasks")?,
            completed_tasks: MappingHelpers::get_u64(row, "completed_tasks")?,
            failed_tasks: MappingHelpers::get_u64(row, "failed_tasks")?,
            cancelled_tasks: MappingHelpers::get_u64(row, "cancelled_tasks")?,
            success_rate: row.try_get("success_rate")?,
            average_processing_time_ms: row.try_get("average_processing_time")?,
            throughput_per_minute: row.try_get("throughput_per_minute")?,
            memory_usage_mb: None,
            resource_group_stats: MappingHelpers::parse_json_or_default(
                row,
                "resource_group_stats",
            )?,
        })
    }
}

#[async_trait]
impl MetricsRepository for SqliteMetricsRepository {
    #[instrument(skip(self, metrics), fields(session_id = %metrics.session_id))]
    async fn insert_snapshot(&self, metrics: &QueueMetrics) -> QueueResult<()> {
        let context = repo_context!(
            RepositoryOperation::Create,
            EntityKind::Metrics,
            session = metrics.session_id.clone()
        );
        let group_stats = serde_json::to_string(&metrics.resource_group_stats)
            .map_err(|e| RepositoryErrorHelpers::serialization_error(context.clone(), e))?;

        // 同一时刻的重复快照直接覆盖
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_metrics (
                session_id, snapshot_time, total_tasks, pending_tasks, running_tasks,
                completed_tasks, failed_tasks, cancelled_tasks, success_rate,
                average_processing_time, throughput_per_minute, resource_group_stats
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&metrics.session_id)
        .bind(metrics.snapshot_time)
        .bind(MappingHelpers::to_i64(metrics.total_tasks))
        .bind(MappingHelpers::to_i64(metrics.pending_tasks))
        .bind(MappingHelpers::to_i64(metrics.running_tasks))
        .bind(MappingHelpers::to_i64(metrics.completed_tasks))
        .bind(MappingHelpers::to_i64(metrics.failed_tasks))
        .bind(MappingHelpers::to_i64(metrics.cancelled_tasks))
        .bind(metrics.success_rate)
        .bind(metrics.average_processing_time_ms)
        .bind(metrics.throughput_per_minute)
        .bind(group_stats)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        debug!(
            "指标快照已写入: session={}, total={}",
            metrics.session_id, metrics.total_tasks
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest(&self, session_id: &str) -> QueueResult<Option<QueueMetrics>> {
        let context = repo_context!(
            RepositoryOperation::Read,
            EntityKind::Metrics,
            session = session_id
        );
        let sql = format!(
            "SELECT {METRICS_COLUMNS} FROM queue_metrics WHERE session_id = ? \
             ORDER BY snapshot_time DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pools.reader)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_metrics).transpose()
    }

    #[instrument(skip(self))]
    async fn list_snapshots(&self, session_id: &str, limit: usize) -> QueueResult<Vec<QueueMetrics>> {
        let context = repo_context!(
            RepositoryOperation::Query,
            EntityKind::Metrics,
            session = session_id
        );
        let sql = format!(
            "SELECT {METRICS_COLUMNS} FROM queue_metrics WHERE session_id = ? \
             ORDER BY snapshot_time DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .bind(limit as i64)
            .fetch_all(&self.pools.reader)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_metrics).collect()
    }

    #[instrument(skip(self))]
    async fn resource_group_performance(&self) -> QueueResult<Vec<ResourceGroupPerformance>> {
        let context = repo_context!(RepositoryOperation::Aggregate, EntityKind::Metrics)
            .with_additional_info("resource_group_performance");
        let rows = sqlx::query(
            "SELECT resource_group, total_tasks, completed_tasks, failed_tasks, success_rate, \
             average_duration_ms FROM resource_group_performance ORDER BY resource_group",
        )
        .fetch_all(&self.pools.reader)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter()
            .map(|row| {
                Ok(ResourceGroupPerformance {
                    resource_group: row.try_get("resource_group")?,
                    total_tasks: MappingHelpers::get_u64(row, "total_tasks")?,
                    completed_tasks: MappingHelpers::get_u64(row, "completed_tasks")?,
                    failed_tasks: MappingHelpers::get_u64(row, "failed_tasks")?,
                    success_rate: row.try_get("success_rate")?,
                    average_duration_ms: row.try_get("average_duration_ms")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> QueueResult<u64> {
        let context = repo_context!(RepositoryOperation::Purge, EntityKind::Metrics);
        let result = sqlx::query(
            "DELETE FROM queue_metrics WHERE rowid IN ( \
                 SELECT rowid FROM queue_metrics WHERE snapshot_time < ? LIMIT ?)",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        Ok(result.rows_affected())
    }
}
