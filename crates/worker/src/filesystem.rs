use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use taskgate_core::{DirEntryInfo, FileSystemOperations};
use taskgate_errors::{QueueError, QueueResult};
use tracing::debug;

/// 基于 tokio::fs 的文件系统操作
#[derive(Debug, Clone, Default)]
pub struct TokioFileSystem {
    /// 搜索时是否跟随符号链接
    follow_links: bool,
}

impl TokioFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_follow_links(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }
}

/// 不存在、无权限等错误重试也不会成功
pub(crate) fn io_error(action: &str, path: &Path, error: std::io::Error) -> QueueError {
    let message = format!("{action} {} 失败: {error}", path.display());
    match error.kind() {
        ErrorKind::NotFound
        | ErrorKind::PermissionDenied
        | ErrorKind::InvalidInput
        | ErrorKind::InvalidData
        | ErrorKind::AlreadyExists => QueueError::NonRetryable(message),
        _ => QueueError::operation(message),
    }
}

#[async_trait]
impl FileSystemOperations for TokioFileSystem {
    async fn read_file(&self, path: &Path) -> QueueResult<Vec<u8>> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| io_error("读取文件", path, e))?;
        debug!("读取文件 {}: {} 字节", path.display(), contents.len());
        Ok(contents)
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> QueueResult<u64> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("创建目录", parent, e))?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| io_error("写入文件", path, e))?;
        debug!("写入文件 {}: {} 字节", path.display(), contents.len());
        Ok(contents.len() as u64)
    }

    async fn list_directory(&self, path: &Path) -> QueueResult<Vec<DirEntryInfo>> {
        let mut reader = tokio::fs::read_dir(path)
            .await
            .map_err(|e| io_error("读取目录", path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| io_error("读取目录", path, e))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| io_error("读取元数据", &entry.path(), e))?;
            entries.push(DirEntryInfo {
                path: entry.path(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn find_files(&self, root: &Path, pattern: &str) -> QueueResult<Vec<PathBuf>> {
        let metadata = tokio::fs::metadata(root)
            .await
            .map_err(|e| io_error("搜索目录", root, e))?;
        if !metadata.is_dir() {
            return Err(QueueError::NonRetryable(format!(
                "搜索根路径不是目录: {}",
                root.display()
            )));
        }

        let root = root.to_path_buf();
        let pattern = pattern.to_string();
        let follow_links = self.follow_links;
        let found = tokio::task::spawn_blocking(move || {
            let mut found: Vec<PathBuf> = walkdir::WalkDir::new(&root)
                .follow_links(follow_links)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| wildcard_match(&pattern, name))
                })
                .map(|entry| entry.into_path())
                .collect();
            found.sort();
            found
        })
        .await
        .map_err(|e| QueueError::Internal(format!("文件搜索任务异常: {e}")))?;

        debug!("搜索到 {} 个匹配文件", found.len());
        Ok(found)
    }
}

/// `*` 匹配任意长度字符, `?` 匹配单个字符
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.rs", "main.rs"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("data_??.csv", "data_01.csv"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("*.rs", "main.rs.bak"));
        assert!(!wildcard_match("data_??.csv", "data_1.csv"));
        assert!(!wildcard_match("", "x"));
    }

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let path = dir.path().join("nested/deeper/out.txt");

        let written = fs.write_file(&path, b"hello").await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(fs.read_file(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_retryable() {
        let dir = TempDir::new().unwrap();
        let err = TokioFileSystem::new()
            .read_file(&dir.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NonRetryable(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_and_find() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        fs.write_file(&dir.path().join("a.log"), b"1").await.unwrap();
        fs.write_file(&dir.path().join("b.txt"), b"22").await.unwrap();
        fs.write_file(&dir.path().join("sub/c.log"), b"333").await.unwrap();

        let listing = fs.list_directory(dir.path()).await.unwrap();
        assert_eq!(listing.len(), 3);
        let sub = listing.iter().find(|e| e.path.ends_with("sub")).unwrap();
        assert!(sub.is_dir);
        let b = listing.iter().find(|e| e.path.ends_with("b.txt")).unwrap();
        assert_eq!(b.size, 2);

        let logs = fs.find_files(dir.path(), "*.log").await.unwrap();
        assert_eq!(
            logs,
            vec![dir.path().join("a.log"), dir.path().join("sub/c.log")]
        );
    }
}
