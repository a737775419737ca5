//! Test data builders
//!
//! Builders with sensible defaults for the persisted queue entities.

use chrono::{DateTime, Utc};
use taskgate_core::{QueueSession, QueueTask, ResourceGroup, TaskStatus, DEFAULT_PRIORITY};

/// Builder for [`QueueTask`] rows
pub struct QueueTaskBuilder {
    task: QueueTask,
}

impl QueueTaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: QueueTask {
                id: id.to_string(),
                session_id: "test-session".to_string(),
                task_type: "compute".to_string(),
                resource_group: ResourceGroup::Computation,
                priority: DEFAULT_PRIORITY,
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                retry_count: 0,
                max_retries: 3,
                last_error: None,
                estimated_duration_ms: None,
                actual_duration_ms: None,
                file_path: None,
                file_size: None,
                operation_data: serde_json::Value::Null,
            },
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.task.session_id = session_id.to_string();
        self
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self
    }

    pub fn with_resource_group(mut self, group: ResourceGroup) -> Self {
        self.task.resource_group = group;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        self
    }

    pub fn running_since(mut self, at: DateTime<Utc>) -> Self {
        self.task.status = TaskStatus::Running;
        self.task.started_at = Some(at);
        self
    }

    /// Terminal row finished at `at` after `duration_ms`
    pub fn finished(mut self, status: TaskStatus, at: DateTime<Utc>, duration_ms: u64) -> Self {
        self.task.status = status;
        self.task.completed_at = Some(at);
        self.task.actual_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_operation_data(mut self, data: serde_json::Value) -> Self {
        self.task.operation_data = data;
        self
    }

    pub fn build(self) -> QueueTask {
        self.task
    }
}

/// Builder for [`QueueSession`] rows
pub struct SessionBuilder {
    session: QueueSession,
}

impl SessionBuilder {
    pub fn new(session_id: &str) -> Self {
        Self {
            session: QueueSession::new(session_id.to_string(), std::process::id(), Utc::now()),
        }
    }

    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.session.process_id = process_id;
        self
    }

    pub fn last_active_at(mut self, at: DateTime<Utc>) -> Self {
        self.session.started_at = at;
        self.session.created_at = at;
        self.session.last_activity = at;
        self
    }

    pub fn build(self) -> QueueSession {
        self.session
    }
}
