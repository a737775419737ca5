//! 透明适配器
//!
//! 把常见的文件、网络和批量数据操作包装成队列任务，调用方拿到的仍是操作本身的返回值。
//! 队列本身出问题时（熔断、持久化失败、服务关闭）直接执行操作，保证命令行行为不变。

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::json;
use taskgate_core::{
    DirEntryInfo, FileSystemOperations, HttpResponse, NetworkOperations, ResourceGroup,
    TaskRequest, TaskSubmitter, DEFAULT_PRIORITY,
};
use taskgate_errors::{QueueError, QueueResult};
use tracing::{debug, warn};

use crate::executors::CapturingExecutor;

pub const OP_FILE_READ: &str = "file_read";
pub const OP_FILE_WRITE: &str = "file_write";
pub const OP_DIRECTORY_LIST: &str = "directory_list";
pub const OP_FILE_FIND: &str = "file_find";
pub const OP_HTTP_FETCH: &str = "http_fetch";
pub const OP_HTTP_POST: &str = "http_post";
pub const OP_HTTP_DOWNLOAD: &str = "http_download";
pub const OP_PROCESS_DATA: &str = "process_data";

pub struct TransparentAdapter {
    submitter: Option<Arc<dyn TaskSubmitter>>,
    filesystem: Arc<dyn FileSystemOperations>,
    network: Arc<dyn NetworkOperations>,
    default_priority: u8,
}

impl TransparentAdapter {
    pub fn new(
        submitter: Arc<dyn TaskSubmitter>,
        filesystem: Arc<dyn FileSystemOperations>,
        network: Arc<dyn NetworkOperations>,
    ) -> Self {
        Self {
            submitter: Some(submitter),
            filesystem,
            network,
            default_priority: DEFAULT_PRIORITY,
        }
    }

    /// 不经过队列，所有操作直接执行
    pub fn direct(
        filesystem: Arc<dyn FileSystemOperations>,
        network: Arc<dyn NetworkOperations>,
    ) -> Self {
        Self {
            submitter: None,
            filesystem,
            network,
            default_priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn is_queued(&self) -> bool {
        self.submitter.is_some()
    }

    pub async fn read_file(&self, path: impl AsRef<Path>) -> QueueResult<Vec<u8>> {
        let path = path.as_ref().to_path_buf();
        let request = self
            .request(OP_FILE_READ)
            .with_file(path.display().to_string(), None);
        let filesystem = self.filesystem.clone();

        self.run(
            request,
            move || {
                let filesystem = filesystem.clone();
                let path = path.clone();
                async move { filesystem.read_file(&path).await }
            },
            |contents: &Vec<u8>| json!({ "bytes": contents.len() }),
        )
        .await
    }

    pub async fn write_file(
        &self,
        path: impl AsRef<Path>,
        contents: impl Into<Vec<u8>>,
    ) -> QueueResult<u64> {
        let path = path.as_ref().to_path_buf();
        let contents: Arc<Vec<u8>> = Arc::new(contents.into());
        let request = self
            .request(OP_FILE_WRITE)
            .with_file(path.display().to_string(), Some(contents.len() as u64));
        let filesystem = self.filesystem.clone();

        self.run(
            request,
            move || {
                let filesystem = filesystem.clone();
                let path = path.clone();
                let contents = contents.clone();
                async move { filesystem.write_file(&path, &contents).await }
            },
            |written: &u64| json!({ "bytes": written }),
        )
        .await
    }

    pub async fn list_directory(&self, path: impl AsRef<Path>) -> QueueResult<Vec<DirEntryInfo>> {
        let path = path.as_ref().to_path_buf();
        let request = self
            .request(OP_DIRECTORY_LIST)
            .with_file(path.display().to_string(), None);
        let filesystem = self.filesystem.clone();

        self.run(
            request,
            move || {
                let filesystem = filesystem.clone();
                let path = path.clone();
                async move { filesystem.list_directory(&path).await }
            },
            |entries: &Vec<DirEntryInfo>| json!({ "entries": entries.len() }),
        )
        .await
    }

    pub async fn find_files(
        &self,
        root: impl AsRef<Path>,
        pattern: &str,
    ) -> QueueResult<Vec<PathBuf>> {
        let root = root.as_ref().to_path_buf();
        let pattern = pattern.to_string();
        let request = self
            .request(OP_FILE_FIND)
            .with_file(root.display().to_string(), None)
            .with_operation_data(json!({ "pattern": pattern }));
        let filesystem = self.filesystem.clone();

        self.run(
            request,
            move || {
                let filesystem = filesystem.clone();
                let root = root.clone();
                let pattern = pattern.clone();
                async move { filesystem.find_files(&root, &pattern).await }
            },
            |found: &Vec<PathBuf>| json!({ "matches": found.len() }),
        )
        .await
    }

    pub async fn fetch(&self, url: &str) -> QueueResult<HttpResponse> {
        let url = url.to_string();
        let request = self
            .request(OP_HTTP_FETCH)
            .with_operation_data(json!({ "url": url }));
        let network = self.network.clone();

        self.run(
            request,
            move || {
                let network = network.clone();
                let url = url.clone();
                async move { network.fetch(&url).await }
            },
            summarize_response,
        )
        .await
    }

    pub async fn post(&self, url: &str, body: serde_json::Value) -> QueueResult<HttpResponse> {
        let url = url.to_string();
        let body = Arc::new(body);
        let request = self
            .request(OP_HTTP_POST)
            .with_operation_data(json!({ "url": url }));
        let network = self.network.clone();

        self.run(
            request,
            move || {
                let network = network.clone();
                let url = url.clone();
                let body = body.clone();
                async move { network.post(&url, &body).await }
            },
            summarize_response,
        )
        .await
    }

    /// 下载到本地文件，返回写入的字节数
    ///
    /// 非 2xx 响应不会写文件。
    pub async fn download(&self, url: &str, destination: impl AsRef<Path>) -> QueueResult<u64> {
        let url = url.to_string();
        let destination = destination.as_ref().to_path_buf();
        let request = self
            .request(OP_HTTP_DOWNLOAD)
            .with_resource_group(ResourceGroup::Network)
            .with_file(destination.display().to_string(), None)
            .with_operation_data(json!({ "url": url }));
        let network = self.network.clone();
        let filesystem = self.filesystem.clone();

        self.run(
            request,
            move || {
                let network = network.clone();
                let filesystem = filesystem.clone();
                let url = url.clone();
                let destination = destination.clone();
                async move {
                    let response = network.fetch(&url).await?;
                    if !response.is_success() {
                        return Err(QueueError::NonRetryable(format!(
                            "下载 {url} 失败: 状态码 {}",
                            response.status
                        )));
                    }
                    filesystem.write_file(&destination, &response.body).await
                }
            },
            |written: &u64| json!({ "bytes": written }),
        )
        .await
    }

    /// 对一批数据逐项执行转换，在阻塞线程池上运行
    pub async fn process_data<I, O, F>(&self, items: Vec<I>, transform: F) -> QueueResult<Vec<O>>
    where
        I: Clone + Send + Sync + 'static,
        O: Send + 'static,
        F: Fn(I) -> QueueResult<O> + Send + Sync + 'static,
    {
        let items = Arc::new(items);
        let transform = Arc::new(transform);
        let request = self
            .request(OP_PROCESS_DATA)
            .with_operation_data(json!({ "items": items.len() }));

        self.run(
            request,
            move || {
                let items = items.clone();
                let transform = transform.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        items
                            .iter()
                            .cloned()
                            .map(|item| transform(item))
                            .collect::<QueueResult<Vec<O>>>()
                    })
                    .await
                    .map_err(|e| QueueError::operation(format!("批量处理线程异常: {e}")))?
                }
            },
            |outputs: &Vec<O>| json!({ "items": outputs.len() }),
        )
        .await
    }

    fn request(&self, operation: &str) -> TaskRequest {
        TaskRequest::new(operation).with_priority(self.default_priority)
    }

    async fn run<T, F, Fut>(
        &self,
        request: TaskRequest,
        operation: F,
        summarize: fn(&T) -> serde_json::Value,
    ) -> QueueResult<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<T>> + Send + 'static,
    {
        let Some(submitter) = &self.submitter else {
            return operation().await;
        };

        let task_type = request.task_type.clone();
        let operation = Arc::new(operation);
        let slot = Arc::new(Mutex::new(None));
        let executor = Arc::new(CapturingExecutor::new(
            operation.clone(),
            slot.clone(),
            summarize,
        ));

        match submitter.submit_and_wait(request, executor).await {
            Ok(outcome) => {
                debug!(
                    "{} 任务 {} 完成, 共尝试 {} 次",
                    task_type, outcome.task_id, outcome.attempts
                );
                slot.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .ok_or_else(|| QueueError::Internal(format!("{task_type} 任务完成但没有返回值")))
            }
            Err(e) if e.is_enqueue_failure() => {
                warn!("{} 无法通过队列执行, 直接执行: {}", task_type, e);
                (*operation)().await
            }
            Err(e) => Err(e),
        }
    }
}

fn summarize_response(response: &HttpResponse) -> serde_json::Value {
    json!({ "status": response.status, "bytes": response.body.len() })
}
