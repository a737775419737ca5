use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskgate_errors::{QueueError, QueueResult};
use uuid::Uuid;

use super::resource_group::ResourceGroup;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
const MAX_TASK_TYPE_LEN: usize = 128;
const MAX_ESTIMATED_DURATION: Duration = Duration::from_secs(24 * 3600);

/// 队列任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(QueueError::validation(format!("未知的任务状态: {other}"))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<TaskStatus>()
            .map_err(|_| format!("Invalid task status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 持久化的任务记录，对应 `queue_tasks` 表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: String,
    pub session_id: String,
    pub task_type: String,
    pub resource_group: ResourceGroup,
    /// 1 最高, 10 最低
    pub priority: u8,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub estimated_duration_ms: Option<u64>,
    pub actual_duration_ms: Option<u64>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub operation_data: serde_json::Value,
}

impl QueueTask {
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn estimated_duration(&self) -> Option<Duration> {
        self.estimated_duration_ms.map(Duration::from_millis)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 '{}' (ID: {}, 资源组: {})",
            self.task_type, self.id, self.resource_group
        )
    }
}

/// 调用方提交任务时使用的描述，入队时转换为 [`QueueTask`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: Option<String>,
    pub session_id: Option<String>,
    pub task_type: String,
    pub resource_group: Option<ResourceGroup>,
    pub priority: u8,
    pub max_retries: Option<u32>,
    pub estimated_duration: Option<Duration>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub operation_data: serde_json::Value,
}

impl TaskRequest {
    pub fn new<S: Into<String>>(task_type: S) -> Self {
        Self {
            id: None,
            session_id: None,
            task_type: task_type.into(),
            resource_group: None,
            priority: DEFAULT_PRIORITY,
            max_retries: None,
            estimated_duration: None,
            file_path: None,
            file_size: None,
            operation_data: serde_json::Value::Null,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_session<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_resource_group(mut self, group: ResourceGroup) -> Self {
        self.resource_group = Some(group);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = Some(duration);
        self
    }

    pub fn with_file<S: Into<String>>(mut self, path: S, size: Option<u64>) -> Self {
        self.file_path = Some(path.into());
        self.file_size = size;
        self
    }

    pub fn with_operation_data(mut self, data: serde_json::Value) -> Self {
        self.operation_data = data;
        self
    }

    /// 显式指定的资源组优先，否则按操作类型推断
    pub fn effective_resource_group(&self) -> ResourceGroup {
        self.resource_group
            .unwrap_or_else(|| ResourceGroup::infer(&self.task_type, self.estimated_duration))
    }

    /// 入队前的形状校验，失败的任务不会被持久化
    pub fn validate(&self, max_retries_limit: u32) -> QueueResult<()> {
        let task_type = self.task_type.trim();
        if task_type.is_empty() {
            return Err(QueueError::validation("任务类型不能为空"));
        }
        if task_type.len() > MAX_TASK_TYPE_LEN {
            return Err(QueueError::validation(format!(
                "任务类型长度不能超过 {MAX_TASK_TYPE_LEN} 个字符"
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(QueueError::validation(format!(
                "优先级必须在 {MIN_PRIORITY}-{MAX_PRIORITY} 之间, 实际为 {}",
                self.priority
            )));
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries > max_retries_limit {
                return Err(QueueError::validation(format!(
                    "最大重试次数 {max_retries} 超过上限 {max_retries_limit}"
                )));
            }
        }
        if let Some(duration) = self.estimated_duration {
            if duration > MAX_ESTIMATED_DURATION {
                return Err(QueueError::validation("预计耗时不能超过 24 小时"));
            }
        }
        if matches!(&self.id, Some(id) if id.trim().is_empty()) {
            return Err(QueueError::validation("任务ID不能为空字符串"));
        }
        if matches!(&self.session_id, Some(id) if id.trim().is_empty()) {
            return Err(QueueError::validation("会话ID不能为空字符串"));
        }
        Ok(())
    }

    /// 生成待执行的任务记录，缺省的 ID 和会话由调用方补齐
    pub fn into_task(
        self,
        default_session_id: &str,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> QueueTask {
        let resource_group = self.effective_resource_group();
        QueueTask {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id: self
                .session_id
                .unwrap_or_else(|| default_session_id.to_string()),
            task_type: self.task_type,
            resource_group,
            priority: self.priority,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            estimated_duration_ms: self.estimated_duration.map(|d| d.as_millis() as u64),
            actual_duration_ms: None,
            file_path: self.file_path,
            file_size: self.file_size,
            operation_data: self.operation_data,
        }
    }
}

/// 任务成功结束后交给调用方的结果
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub output: serde_json::Value,
    pub attempts: u32,
    pub duration: Duration,
}
