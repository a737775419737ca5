use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskgate_errors::QueueError;

/// 预计耗时超过该值的任务归入内存密集组
pub const LONG_RUNNING_THRESHOLD: Duration = Duration::from_secs(5);

/// 资源组，每组拥有独立的并发、节流和熔断策略
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceGroup {
    Filesystem,
    Network,
    Computation,
    MemoryIntensive,
}

impl ResourceGroup {
    pub const ALL: [ResourceGroup; 4] = [
        ResourceGroup::Filesystem,
        ResourceGroup::Network,
        ResourceGroup::Computation,
        ResourceGroup::MemoryIntensive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceGroup::Filesystem => "filesystem",
            ResourceGroup::Network => "network",
            ResourceGroup::Computation => "computation",
            ResourceGroup::MemoryIntensive => "memory-intensive",
        }
    }

    /// 根据操作类型和预计耗时推断资源组
    ///
    /// 纯函数，匹配不区分大小写，按以下顺序判断:
    /// 1. 包含 `file` / `directory` -> filesystem
    /// 2. 包含 `http` / `fetch` / `download` -> network
    /// 3. 预计耗时超过 5 秒，或包含 `process` / `compress` -> memory-intensive
    /// 4. 其余 -> computation
    pub fn infer(task_type: &str, estimated_duration: Option<Duration>) -> ResourceGroup {
        let name = task_type.to_ascii_lowercase();
        let contains_any = |needles: &[&str]| needles.iter().any(|n| name.contains(n));

        if contains_any(&["file", "directory"]) {
            ResourceGroup::Filesystem
        } else if contains_any(&["http", "fetch", "download"]) {
            ResourceGroup::Network
        } else if estimated_duration.is_some_and(|d| d > LONG_RUNNING_THRESHOLD)
            || contains_any(&["process", "compress"])
        {
            ResourceGroup::MemoryIntensive
        } else {
            ResourceGroup::Computation
        }
    }

    /// 默认并发上限和最小启动间隔
    pub fn default_limits(&self) -> ResourceGroupLimits {
        match self {
            ResourceGroup::Filesystem => ResourceGroupLimits::new(10, Duration::from_millis(10)),
            ResourceGroup::Network => ResourceGroupLimits::new(3, Duration::from_millis(100)),
            ResourceGroup::Computation => ResourceGroupLimits::new(cpu_count(), Duration::ZERO),
            ResourceGroup::MemoryIntensive => {
                ResourceGroupLimits::new(2, Duration::from_millis(500))
            }
        }
    }
}

impl fmt::Display for ResourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceGroup {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" => Ok(ResourceGroup::Filesystem),
            "network" => Ok(ResourceGroup::Network),
            "computation" => Ok(ResourceGroup::Computation),
            "memory-intensive" | "memory_intensive" => Ok(ResourceGroup::MemoryIntensive),
            other => Err(QueueError::validation(format!("未知的资源组: {other}"))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for ResourceGroup {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ResourceGroup {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<ResourceGroup>()
            .map_err(|_| format!("Invalid resource group: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ResourceGroup {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 单个资源组的调度限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceGroupLimits {
    pub max_concurrency: usize,
    pub min_delay: Duration,
}

impl ResourceGroupLimits {
    pub fn new(max_concurrency: usize, min_delay: Duration) -> Self {
        Self {
            max_concurrency,
            min_delay,
        }
    }
}

/// 当前机器可用的 CPU 核数，获取失败时按 1 处理
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_by_name() {
        assert_eq!(ResourceGroup::infer("file_read", None), ResourceGroup::Filesystem);
        assert_eq!(ResourceGroup::infer("list_DIRECTORY", None), ResourceGroup::Filesystem);
        assert_eq!(ResourceGroup::infer("http_post", None), ResourceGroup::Network);
        assert_eq!(ResourceGroup::infer("fetch_index", None), ResourceGroup::Network);
        assert_eq!(ResourceGroup::infer("compress_logs", None), ResourceGroup::MemoryIntensive);
        assert_eq!(ResourceGroup::infer("process_data", None), ResourceGroup::MemoryIntensive);
        assert_eq!(ResourceGroup::infer("hash", None), ResourceGroup::Computation);
    }

    #[test]
    fn test_infer_precedence() {
        // 文件类名称优先于网络和耗时判断
        assert_eq!(
            ResourceGroup::infer("download_file", Some(Duration::from_secs(30))),
            ResourceGroup::Filesystem
        );
        assert_eq!(
            ResourceGroup::infer("http_download", Some(Duration::from_secs(30))),
            ResourceGroup::Network
        );
    }

    #[test]
    fn test_infer_by_duration() {
        assert_eq!(
            ResourceGroup::infer("tokenize", Some(Duration::from_secs(5))),
            ResourceGroup::Computation
        );
        assert_eq!(
            ResourceGroup::infer("tokenize", Some(Duration::from_millis(5001))),
            ResourceGroup::MemoryIntensive
        );
    }

    #[test]
    fn test_infer_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(ResourceGroup::infer("Fetch", None), ResourceGroup::Network);
        }
    }

    #[test]
    fn test_default_limits() {
        let fs = ResourceGroup::Filesystem.default_limits();
        assert_eq!(fs.max_concurrency, 10);
        assert_eq!(fs.min_delay, Duration::from_millis(10));

        let net = ResourceGroup::Network.default_limits();
        assert_eq!(net.max_concurrency, 3);
        assert_eq!(net.min_delay, Duration::from_millis(100));

        let comp = ResourceGroup::Computation.default_limits();
        assert_eq!(comp.max_concurrency, cpu_count());
        assert_eq!(comp.min_delay, Duration::ZERO);

        let mem = ResourceGroup::MemoryIntensive.default_limits();
        assert_eq!(mem.max_concurrency, 2);
        assert_eq!(mem.min_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_parse_and_display() {
        for group in ResourceGroup::ALL {
            assert_eq!(group.as_str().parse::<ResourceGroup>().unwrap(), group);
        }
        assert_eq!(
            "memory_intensive".parse::<ResourceGroup>().unwrap(),
            ResourceGroup::MemoryIntensive
        );
        assert!("gpu".parse::<ResourceGroup>().is_err());
    }
}
