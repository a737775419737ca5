use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskgate_core::{CircuitBreakerRepository, CircuitBreakerSnapshot};
use taskgate_errors::QueueResult;
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;
use crate::database::SqlitePools;
use crate::error_handling::{EntityKind, RepositoryErrorHelpers, RepositoryOperation};
use crate::repo_context;

pub struct SqliteCircuitBreakerRepository {
    pools: SqlitePools,
}

impl SqliteCircuitBreakerRepository {
    pub fn new(pools: SqlitePools) -> Self {
        Self { pools }
    }

    fn row_to_snapshot(row: &SqliteRow) -> QueueResult<CircuitBreakerSnapshot> {
        Ok(CircuitBreakerSnapshot {
            resource_group: row.try_get("resource_group")?,
            session_id: row.try_get("session_id")?,
            state: row.try_get("state")?,
            failure_count: MappingHelpers::get_u32(row, "failure_count")?,
            success_count: MappingHelpers::get_u32(row, "success_count")?,
            last_failure_time: row.try_get("last_failure_time")?,
            last_success_time: row.try_get("last_success_time")?,
            state_changed_at: row.try_get("state_changed_at")?,
            failure_threshold: MappingHelpers::get_u32(row, "failure_threshold")?,
            recovery_timeout_ms: MappingHelpers::get_u64(row, "recovery_timeout_ms")?,
            total_requests: MappingHelpers::get_u64(row, "total_requests")?,
            total_failures: MappingHelpers::get_u64(row, "total_failures")?,
            failure_rate: row.try_get("failure_rate")?,
        })
    }
}

#[async_trait]
impl CircuitBreakerRepository for SqliteCircuitBreakerRepository {
    #[instrument(skip(self, snapshot), fields(
        resource_group = %snapshot.resource_group,
        state = %snapshot.state,
    ))]
    async fn upsert(&self, snapshot: &CircuitBreakerSnapshot) -> QueueResult<()> {
        let context = repo_context!(
            RepositoryOperation::Upsert,
            EntityKind::CircuitBreaker,
            id = snapshot.resource_group.as_str(),
            session = snapshot.session_id.clone()
        );
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker_state (
                resource_group, session_id, state, failure_count, success_count,
                last_failure_time, last_success_time, state_changed_at, failure_threshold,
                recovery_timeout_ms, total_requests, total_failures, failure_rate
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(resource_group) DO UPDATE SET
                session_id = excluded.session_id,
                state = excluded.state,
                failure_count = excluded.failure_count,
                success_count = excluded.success_count,
                last_failure_time = excluded.last_failure_time,
                last_success_time = excluded.last_success_time,
                state_changed_at = excluded.state_changed_at,
                failure_threshold = excluded.failure_threshold,
                recovery_timeout_ms = excluded.recovery_timeout_ms,
                total_requests = excluded.total_requests,
                total_failures = excluded.total_failures,
                failure_rate = excluded.failure_rate
            "#,
        )
        .bind(snapshot.resource_group)
        .bind(&snapshot.session_id)
        .bind(snapshot.state)
        .bind(snapshot.failure_count as i64)
        .bind(snapshot.success_count as i64)
        .bind(snapshot.last_failure_time)
        .bind(snapshot.last_success_time)
        .bind(snapshot.state_changed_at)
        .bind(snapshot.failure_threshold as i64)
        .bind(MappingHelpers::to_i64(snapshot.recovery_timeout_ms))
        .bind(MappingHelpers::to_i64(snapshot.total_requests))
        .bind(MappingHelpers::to_i64(snapshot.total_failures))
        .bind(snapshot.failure_rate)
        .execute(&self.pools.writer)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        debug!("熔断器状态已保存: {}", snapshot.resource_group);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> QueueResult<Vec<CircuitBreakerSnapshot>> {
        let context = repo_context!(RepositoryOperation::Query, EntityKind::CircuitBreaker);
        let rows = sqlx::query(
            "SELECT resource_group, session_id, state, failure_count, success_count, \
             last_failure_time, last_success_time, state_changed_at, failure_threshold, \
             recovery_timeout_ms, total_requests, total_failures, failure_rate \
             FROM circuit_breaker_state ORDER BY resource_group",
        )
        .fetch_all(&self.pools.reader)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_snapshot).collect()
    }
}
