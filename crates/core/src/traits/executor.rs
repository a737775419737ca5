//! 任务执行接口
//!
//! 调度器对每次尝试调用一次 [`TaskExecutor::execute`]，失败且可重试时会在退避后再次调用，
//! 因此实现必须可以重复执行。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{QueueTask, ResourceGroup, TaskOutcome, TaskRequest};
use crate::QueueResult;

/// 单次执行尝试的上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionContext {
    pub task_id: String,
    pub session_id: String,
    pub task_type: String,
    pub resource_group: ResourceGroup,
    /// 从 1 开始
    pub attempt: u32,
    pub retry_count: u32,
    pub operation_data: serde_json::Value,
    pub file_path: Option<String>,
}

impl TaskExecutionContext {
    pub fn for_task(task: &QueueTask) -> Self {
        Self {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            task_type: task.task_type.clone(),
            resource_group: task.resource_group,
            attempt: task.retry_count + 1,
            retry_count: task.retry_count,
            operation_data: task.operation_data.clone(),
            file_path: task.file_path.clone(),
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, context: &TaskExecutionContext) -> QueueResult<serde_json::Value>;
}

/// 提交任务并等待其结束的能力，透明适配器只依赖这个接口
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit_and_wait(
        &self,
        request: TaskRequest,
        executor: Arc<dyn TaskExecutor>,
    ) -> QueueResult<TaskOutcome>;
}
