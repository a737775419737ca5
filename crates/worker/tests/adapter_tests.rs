use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use taskgate_core::{
    ResourceGroup, SystemClock, TaskExecutor, TaskOutcome, TaskRequest, TaskStatus, TaskSubmitter,
};
use taskgate_dispatcher::QueueEngine;
use taskgate_errors::{QueueError, QueueResult};
use taskgate_testing_utils::{test_config, InMemoryStore, MockFileSystem, MockNetwork};
use taskgate_worker::{TokioFileSystem, TransparentAdapter};
use tempfile::TempDir;
use tracing_test::traced_test;

struct Harness {
    engine: QueueEngine,
    store: InMemoryStore,
    filesystem: MockFileSystem,
    network: MockNetwork,
    adapter: TransparentAdapter,
}

async fn harness(filesystem: MockFileSystem, network: MockNetwork) -> Result<Harness> {
    let store = InMemoryStore::new();
    let engine = QueueEngine::start(test_config(), store.repositories(), Arc::new(SystemClock)).await?;
    let adapter = TransparentAdapter::new(
        Arc::new(engine.clone()),
        Arc::new(filesystem.clone()),
        Arc::new(network.clone()),
    );
    Ok(Harness {
        engine,
        store,
        filesystem,
        network,
        adapter,
    })
}

/// 只返回固定错误的提交方
struct RejectingSubmitter {
    error: fn() -> QueueError,
    calls: AtomicUsize,
}

impl RejectingSubmitter {
    fn new(error: fn() -> QueueError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskSubmitter for RejectingSubmitter {
    async fn submit_and_wait(
        &self,
        _request: TaskRequest,
        _executor: Arc<dyn TaskExecutor>,
    ) -> QueueResult<TaskOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

#[tokio::test]
#[traced_test]
async fn test_read_goes_through_queue() -> Result<()> {
    let h = harness(
        MockFileSystem::new().with_file("/data/notes.txt", "hello"),
        MockNetwork::new(),
    )
    .await?;

    let contents = h.adapter.read_file("/data/notes.txt").await?;
    assert_eq!(contents, b"hello");

    let tasks = h.store.all_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, "file_read");
    assert_eq!(tasks[0].resource_group, ResourceGroup::Filesystem);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].file_path.as_deref(), Some("/data/notes.txt"));
    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_write_list_and_find() -> Result<()> {
    let h = harness(MockFileSystem::new(), MockNetwork::new()).await?;

    assert_eq!(h.adapter.write_file("/out/a.log", "abc").await?, 3);
    h.adapter.write_file("/out/b.txt", "de").await?;
    assert_eq!(h.filesystem.contents("/out/a.log"), Some(b"abc".to_vec()));

    let listing = h.adapter.list_directory("/out").await?;
    assert_eq!(listing.len(), 2);

    let found = h.adapter.find_files("/out", "*.log").await?;
    assert_eq!(found, vec![PathBuf::from("/out/a.log")]);

    let write_row = h
        .store
        .all_tasks()
        .into_iter()
        .find(|t| t.task_type == "file_write")
        .expect("write row");
    assert_eq!(write_row.file_size, Some(3));
    assert_eq!(h.store.count_with_status(TaskStatus::Completed), 4);
    h.engine.shutdown().await?;
    Ok(())
}

/// 瞬时网络错误由队列重试，调用方拿到真实响应
#[tokio::test]
async fn test_fetch_retries_transient_failures() -> Result<()> {
    let url = "http://example.test/data";
    let h = harness(
        MockFileSystem::new(),
        MockNetwork::new()
            .with_response(url, 200, "payload")
            .failing_times(url, 2),
    )
    .await?;

    let response = h.adapter.fetch(url).await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "payload");
    assert_eq!(h.network.request_count(), 3);

    let row = &h.store.all_tasks()[0];
    assert_eq!(row.task_type, "http_fetch");
    assert_eq!(row.resource_group, ResourceGroup::Network);
    assert_eq!(row.retry_count, 2);
    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_operation_error_is_returned_unchanged() -> Result<()> {
    let h = harness(MockFileSystem::new(), MockNetwork::new()).await?;

    let err = h.adapter.read_file("/missing").await.unwrap_err();
    assert!(matches!(err, QueueError::NonRetryable(_)));
    // 不可重试的失败不会回退到直接执行
    assert_eq!(h.filesystem.operation_count(), 1);
    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_download_writes_destination() -> Result<()> {
    let h = harness(
        MockFileSystem::new(),
        MockNetwork::new()
            .with_response("http://example.test/file.bin", 200, vec![7u8; 16])
            .with_response("http://example.test/gone", 404, "not found"),
    )
    .await?;

    let written = h
        .adapter
        .download("http://example.test/file.bin", "/downloads/file.bin")
        .await?;
    assert_eq!(written, 16);
    assert_eq!(h.filesystem.contents("/downloads/file.bin"), Some(vec![7u8; 16]));

    let err = h
        .adapter
        .download("http://example.test/gone", "/downloads/gone")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NonRetryable(_)));
    assert!(h.filesystem.contents("/downloads/gone").is_none());
    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_process_data_in_memory_group() -> Result<()> {
    let h = harness(MockFileSystem::new(), MockNetwork::new()).await?;

    let doubled = h
        .adapter
        .process_data(vec![1u64, 2, 3], |n| Ok(n * 2))
        .await?;
    assert_eq!(doubled, vec![2, 4, 6]);
    assert_eq!(
        h.store.all_tasks()[0].resource_group,
        ResourceGroup::MemoryIntensive
    );

    let err = h
        .adapter
        .process_data(vec!["1", "x"], |s: &str| {
            s.parse::<u32>()
                .map_err(|e| QueueError::NonRetryable(format!("无法解析 {s}: {e}")))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NonRetryable(_)));
    h.engine.shutdown().await?;
    Ok(())
}

/// 队列关闭后操作仍然直接执行
#[tokio::test]
#[traced_test]
async fn test_falls_back_when_queue_is_shut_down() -> Result<()> {
    let h = harness(
        MockFileSystem::new().with_file("/data/a", "x"),
        MockNetwork::new(),
    )
    .await?;
    h.engine.shutdown().await?;

    assert_eq!(h.adapter.read_file("/data/a").await?, b"x");
    assert!(h.store.all_tasks().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_falls_back_on_enqueue_failures() -> Result<()> {
    let filesystem = MockFileSystem::new().with_file("/data/a", "x");
    for error in [
        (|| QueueError::circuit_open("filesystem", 1000)) as fn() -> QueueError,
        || QueueError::persistence("磁盘已满"),
        || QueueError::unavailable("正在关闭"),
    ] {
        let submitter = Arc::new(RejectingSubmitter::new(error));
        let adapter = TransparentAdapter::new(
            submitter.clone(),
            Arc::new(filesystem.clone()),
            Arc::new(MockNetwork::new()),
        );
        assert_eq!(adapter.read_file("/data/a").await?, b"x");
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);
    }
    assert_eq!(filesystem.operation_count(), 3);
    Ok(())
}

#[tokio::test]
async fn test_retry_exhaustion_is_not_masked() -> Result<()> {
    let filesystem = MockFileSystem::new().with_file("/data/a", "x");
    let adapter = TransparentAdapter::new(
        Arc::new(RejectingSubmitter::new(|| QueueError::RetryExhausted {
            task_id: "t".into(),
            attempts: 4,
            last_error: "io".into(),
        })),
        Arc::new(filesystem.clone()),
        Arc::new(MockNetwork::new()),
    );

    let err = adapter.read_file("/data/a").await.unwrap_err();
    assert!(matches!(err, QueueError::RetryExhausted { attempts: 4, .. }));
    assert_eq!(filesystem.operation_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_default_priority_applied() -> Result<()> {
    let store = InMemoryStore::new();
    let engine = QueueEngine::start(test_config(), store.repositories(), Arc::new(SystemClock)).await?;
    let adapter = TransparentAdapter::new(
        Arc::new(engine.clone()),
        Arc::new(MockFileSystem::new()),
        Arc::new(MockNetwork::new()),
    )
    .with_default_priority(2);

    adapter.write_file("/p", "1").await?;
    assert_eq!(store.all_tasks()[0].priority, 2);
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_direct_adapter_skips_queue() -> Result<()> {
    let filesystem = MockFileSystem::new();
    let adapter = TransparentAdapter::direct(
        Arc::new(filesystem.clone()),
        Arc::new(MockNetwork::new()),
    );
    assert!(!adapter.is_queued());

    adapter.write_file("/direct", "ok").await?;
    assert_eq!(filesystem.contents("/direct"), Some(b"ok".to_vec()));
    Ok(())
}

#[tokio::test]
async fn test_real_filesystem_through_queue() -> Result<()> {
    let dir = TempDir::new()?;
    let store = InMemoryStore::new();
    let engine = QueueEngine::start(test_config(), store.repositories(), Arc::new(SystemClock)).await?;
    let adapter = TransparentAdapter::new(
        Arc::new(engine.clone()),
        Arc::new(TokioFileSystem::new()),
        Arc::new(MockNetwork::new()),
    );

    adapter.write_file(dir.path().join("report.csv"), "a,b\n").await?;
    adapter.write_file(dir.path().join("nested/data.csv"), "c,d\n").await?;
    adapter.write_file(dir.path().join("readme.md"), "#").await?;

    let found = adapter.find_files(dir.path(), "*.csv").await?;
    assert_eq!(found.len(), 2);
    assert_eq!(adapter.read_file(dir.path().join("report.csv")).await?, b"a,b\n");
    engine.shutdown().await?;
    Ok(())
}
