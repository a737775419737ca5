use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("任务校验失败: {0}")]
    Validation(String),
    #[error("资源组 {resource_group} 熔断中, {retry_after_ms}ms 后可重试")]
    CircuitOpen {
        resource_group: String,
        retry_after_ms: u64,
    },
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("持久化错误: {0}")]
    Persistence(String),
    #[error("操作执行失败: {0}")]
    Operation(String),
    #[error("操作失败(不可重试): {0}")]
    NonRetryable(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("任务 {task_id} 重试耗尽, 共尝试 {attempts} 次: {last_error}")]
    RetryExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("任务已取消: {task_id}")]
    Cancelled { task_id: String },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("会话未找到: {id}")]
    SessionNotFound { id: String },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("队列服务不可用: {0}")]
    ServiceUnavailable(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }
    pub fn operation<S: Into<String>>(msg: S) -> Self {
        Self::Operation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ServiceUnavailable(msg.into())
    }
    pub fn circuit_open<S: Into<String>>(resource_group: S, retry_after_ms: u64) -> Self {
        Self::CircuitOpen {
            resource_group: resource_group.into(),
            retry_after_ms,
        }
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn session_not_found<S: Into<String>>(id: S) -> Self {
        Self::SessionNotFound { id: id.into() }
    }
    pub fn cancelled<S: Into<String>>(task_id: S) -> Self {
        Self::Cancelled {
            task_id: task_id.into(),
        }
    }

    /// 只有被包装的操作本身失败或超时才进入重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Operation(_) | QueueError::Timeout(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, QueueError::CircuitOpen { .. })
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, QueueError::Persistence(_) | QueueError::Database(_))
    }

    /// 入队阶段的失败，调用方可以改为直接执行操作
    pub fn is_enqueue_failure(&self) -> bool {
        matches!(
            self,
            QueueError::CircuitOpen { .. }
                | QueueError::Persistence(_)
                | QueueError::Database(_)
                | QueueError::ServiceUnavailable(_)
                | QueueError::Cancelled { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::Internal(_) | QueueError::Configuration(_)
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            QueueError::Validation(_) => "任务参数有误",
            QueueError::CircuitOpen { .. } => "资源暂时不可用，请稍后重试",
            QueueError::TaskNotFound { .. } => "请求的任务不存在",
            QueueError::SessionNotFound { .. } => "请求的会话不存在",
            QueueError::Timeout(_) => "操作超时，请稍后重试",
            QueueError::RetryExhausted { .. } => "操作多次重试后仍然失败",
            QueueError::Cancelled { .. } => "任务已被取消",
            QueueError::Configuration(_) => "配置有误，请检查配置文件",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(QueueError::operation("boom").is_retryable());
        assert!(QueueError::Timeout("5s".into()).is_retryable());
        assert!(!QueueError::NonRetryable("missing".into()).is_retryable());
        assert!(!QueueError::circuit_open("network", 100).is_retryable());
        assert!(!QueueError::validation("bad").is_retryable());
    }

    #[test]
    fn test_enqueue_failure_classification() {
        assert!(QueueError::circuit_open("network", 100).is_enqueue_failure());
        assert!(QueueError::persistence("disk full").is_enqueue_failure());
        assert!(QueueError::unavailable("shutting down").is_enqueue_failure());
        assert!(!QueueError::validation("bad").is_enqueue_failure());
        assert!(!QueueError::operation("boom").is_enqueue_failure());
    }

    #[test]
    fn test_circuit_open_message_names_group() {
        let err = QueueError::circuit_open("network", 1500);
        let msg = err.to_string();
        assert!(msg.contains("network"));
        assert!(msg.contains("1500"));
        assert!(err.is_circuit_open());
    }
}
