use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::QueueResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryInfo {
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

/// 注入的文件系统操作
#[async_trait]
pub trait FileSystemOperations: Send + Sync {
    async fn read_file(&self, path: &Path) -> QueueResult<Vec<u8>>;
    /// 返回写入的字节数
    async fn write_file(&self, path: &Path, contents: &[u8]) -> QueueResult<u64>;
    async fn list_directory(&self, path: &Path) -> QueueResult<Vec<DirEntryInfo>>;
    /// `pattern` 支持 `*` 和 `?` 通配，匹配文件名
    async fn find_files(&self, root: &Path, pattern: &str) -> QueueResult<Vec<PathBuf>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// 注入的网络请求操作
#[async_trait]
pub trait NetworkOperations: Send + Sync {
    async fn fetch(&self, url: &str) -> QueueResult<HttpResponse>;
    async fn post(&self, url: &str, body: &serde_json::Value) -> QueueResult<HttpResponse>;
}
