use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 进程存活记录，每个心跳周期写入一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHeartbeat {
    pub process_id: u32,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub uptime_seconds: u64,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub consecutive_failures: u64,
    pub memory_leak_detected: bool,
    /// 没有垃圾回收器，恒为 false，保留该列以兼容表结构
    pub gc_triggered: bool,
    pub circuit_breaker_open: bool,
}
