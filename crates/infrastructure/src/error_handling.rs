//! Repository error context helpers
//!
//! Every SQLite repository call carries an [`OperationContext`] describing what was
//! being done to which entity. When sqlx fails, the error is logged once with that
//! context and converted into a [`QueueError::Persistence`].

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::Error as SqlxError;
use taskgate_errors::QueueError;
use tracing::{error, instrument};

/// Operation context for repository operations
#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Upsert,
    Query,
    Aggregate,
    Purge,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Upsert => write!(f, "写入"),
            RepositoryOperation::Query => write!(f, "查询"),
            RepositoryOperation::Aggregate => write!(f, "聚合"),
            RepositoryOperation::Purge => write!(f, "清理"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

/// Which table family an operation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Task,
    Session,
    Metrics,
    Heartbeat,
    CircuitBreaker,
    Schema,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Task => write!(f, "任务"),
            EntityKind::Session => write!(f, "会话"),
            EntityKind::Metrics => write!(f, "指标快照"),
            EntityKind::Heartbeat => write!(f, "心跳记录"),
            EntityKind::CircuitBreaker => write!(f, "熔断器状态"),
            EntityKind::Schema => write!(f, "数据库结构"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: RepositoryOperation,
    pub entity: EntityKind,
    pub entity_id: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub additional_info: Option<String>,
}

impl OperationContext {
    pub fn new(operation: RepositoryOperation, entity: EntityKind) -> Self {
        Self {
            operation,
            entity,
            entity_id: None,
            session_id: None,
            timestamp: Utc::now(),
            additional_info: None,
        }
    }

    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_additional_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }

    pub fn entity_description(&self) -> String {
        let mut desc = self.entity.to_string();
        if let Some(id) = &self.entity_id {
            desc.push_str(&format!(" (ID: {id})"));
        }
        if let Some(session_id) = &self.session_id {
            desc.push_str(&format!(" [会话: {session_id}]"));
        }
        if let Some(info) = &self.additional_info {
            desc.push_str(&format!(" - {info}"));
        }
        desc
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    #[instrument(skip_all, fields(
        operation = %context.operation,
        entity = %context.entity,
        entity_id = ?context.entity_id,
        session_id = ?context.session_id,
    ))]
    pub fn database_error(context: OperationContext, error: SqlxError) -> QueueError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::Database(db_error) => {
                if db_error.is_unique_violation() {
                    format!("{operation_desc}{entity_desc}时发生唯一约束冲突: {db_error}")
                } else {
                    format!("{operation_desc}{entity_desc}时发生数据库错误: {db_error}")
                }
            }
            SqlxError::PoolClosed => {
                format!("{operation_desc}{entity_desc}时数据库连接池已关闭")
            }
            SqlxError::PoolTimedOut => {
                format!("{operation_desc}{entity_desc}时数据库连接池超时")
            }
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            SqlxError::ColumnDecode { .. } | SqlxError::Decode(_) => {
                format!("{operation_desc}{entity_desc}时解析数据失败: {error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生未知数据库错误: {error}"),
        };

        error!(error = %error, "{}", error_msg);
        QueueError::persistence(error_msg)
    }

    pub fn serialization_error(context: OperationContext, error: serde_json::Error) -> QueueError {
        let msg = format!(
            "{}{}时序列化失败: {}",
            context.operation,
            context.entity_description(),
            error
        );
        error!(error = %error, "{}", msg);
        QueueError::Serialization(msg)
    }

    /// Unique-key conflicts on insert are caller errors, not storage failures
    pub fn is_unique_violation(error: &SqlxError) -> bool {
        matches!(error, SqlxError::Database(db_error) if db_error.is_unique_violation())
    }
}

/// Build an [`OperationContext`] for a repository call
#[macro_export]
macro_rules! repo_context {
    ($operation:expr, $entity:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity)
    };
    ($operation:expr, $entity:expr, id = $id:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity).with_entity_id($id)
    };
    ($operation:expr, $entity:expr, session = $session:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity)
            .with_session_id($session)
    };
    ($operation:expr, $entity:expr, id = $id:expr, session = $session:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity)
            .with_entity_id($id)
            .with_session_id($session)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_description() {
        let context = repo_context!(
            RepositoryOperation::Update,
            EntityKind::Task,
            id = "t-1",
            session = "s-1"
        )
        .with_additional_info("标记完成");
        let desc = context.entity_description();
        assert!(desc.contains("任务"));
        assert!(desc.contains("t-1"));
        assert!(desc.contains("s-1"));
        assert!(desc.contains("标记完成"));
    }

    #[test]
    fn test_database_error_becomes_persistence() {
        let context = repo_context!(RepositoryOperation::Read, EntityKind::Session);
        let err = RepositoryErrorHelpers::database_error(context, SqlxError::PoolClosed);
        assert!(err.is_persistence());
        assert!(err.to_string().contains("连接池已关闭"));
    }
}
