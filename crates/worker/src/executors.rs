use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use taskgate_core::{TaskExecutionContext, TaskExecutor};
use taskgate_errors::QueueResult;
use tracing::debug;

/// 由闭包实现的任务执行器
///
/// 闭包在每次尝试时都会被调用一次。
pub struct FnExecutor<F> {
    name: String,
    operation: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(TaskExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = QueueResult<serde_json::Value>> + Send,
{
    pub fn new<S: Into<String>>(name: S, operation: F) -> Self {
        Self {
            name: name.into(),
            operation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = QueueResult<serde_json::Value>> + Send,
{
    async fn execute(&self, context: &TaskExecutionContext) -> QueueResult<serde_json::Value> {
        debug!(
            "执行器 {} 处理任务 {} (第 {} 次尝试)",
            self.name, context.task_id, context.attempt
        );
        (self.operation)(context.clone()).await
    }
}

/// 保存操作的原始返回值，队列结果里只放摘要
///
/// 透明适配器用它把类型化的结果带回调用方。
pub(crate) struct CapturingExecutor<T, F> {
    operation: Arc<F>,
    slot: Arc<Mutex<Option<T>>>,
    summarize: fn(&T) -> serde_json::Value,
    _output: PhantomData<fn() -> T>,
}

impl<T, F, Fut> CapturingExecutor<T, F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<T>> + Send,
{
    pub(crate) fn new(
        operation: Arc<F>,
        slot: Arc<Mutex<Option<T>>>,
        summarize: fn(&T) -> serde_json::Value,
    ) -> Self {
        Self {
            operation,
            slot,
            summarize,
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> TaskExecutor for CapturingExecutor<T, F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<T>> + Send,
{
    async fn execute(&self, _context: &TaskExecutionContext) -> QueueResult<serde_json::Value> {
        let value = (self.operation)().await?;
        let summary = (self.summarize)(&value);
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_core::{QueueTask, ResourceGroup, TaskRequest};
    use taskgate_errors::QueueError;

    fn context() -> TaskExecutionContext {
        let task: QueueTask = TaskRequest::new("hash")
            .with_id("t-1")
            .with_resource_group(ResourceGroup::Computation)
            .into_task("s", 3, chrono::Utc::now());
        TaskExecutionContext::for_task(&task)
    }

    #[tokio::test]
    async fn test_fn_executor_receives_context() {
        let executor = FnExecutor::new("echo", |ctx: TaskExecutionContext| async move {
            Ok(serde_json::json!({"task": ctx.task_id, "attempt": ctx.attempt}))
        });
        assert_eq!(executor.name(), "echo");

        let output = executor.execute(&context()).await.unwrap();
        assert_eq!(output, serde_json::json!({"task": "t-1", "attempt": 1}));
    }

    #[tokio::test]
    async fn test_capturing_executor_stores_value() {
        let slot = Arc::new(Mutex::new(None));
        let executor = CapturingExecutor::new(
            Arc::new(|| async { Ok::<_, QueueError>(vec![1u8, 2, 3]) }),
            slot.clone(),
            |bytes: &Vec<u8>| serde_json::json!({"bytes": bytes.len()}),
        );

        let summary = executor.execute(&context()).await.unwrap();
        assert_eq!(summary, serde_json::json!({"bytes": 3}));
        assert_eq!(slot.lock().unwrap().take(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_capturing_executor_leaves_slot_empty_on_error() {
        let slot: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let executor = CapturingExecutor::new(
            Arc::new(|| async { Err::<u64, _>(QueueError::operation("io")) }),
            slot.clone(),
            |_| serde_json::Value::Null,
        );

        assert!(executor.execute(&context()).await.is_err());
        assert!(slot.lock().unwrap().is_none());
    }
}
