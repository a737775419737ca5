use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, warn};

/// 进程内存采样
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used_mb: f64,
    pub total_mb: f64,
}

/// 进程资源监控
///
/// 读取 /proc 获取常驻内存和系统总内存，非 Linux 平台返回 0。
pub struct ResourceMonitor {
    started_at: Instant,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn sample(&self) -> MemorySample {
        MemorySample {
            used_mb: Self::get_memory_usage_mb(),
            total_mb: Self::get_total_memory_mb(),
        }
    }

    fn get_memory_usage_mb() -> f64 {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string("/proc/self/status") {
                Ok(status) => parse_kb_field(&status, "VmRSS:").map_or(0.0, kb_to_mb),
                Err(e) => {
                    debug!("读取 /proc/self/status 失败: {}", e);
                    0.0
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }

    fn get_total_memory_mb() -> f64 {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|info| parse_kb_field(&info, "MemTotal:"))
                .map_or(0.0, kb_to_mb)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }
}

fn parse_kb_field(content: &str, field: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

/// 判断进程是否仍然存活，用于回收崩溃进程留下的会话
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// 内存泄漏检测
///
/// 最近 `samples` 次采样单调递增，且总增长超过阈值时判定为疑似泄漏。
#[derive(Debug)]
pub struct MemoryLeakDetector {
    threshold_mb: f64,
    samples: usize,
    history: VecDeque<f64>,
}

impl MemoryLeakDetector {
    pub fn new(threshold_mb: f64, samples: usize) -> Self {
        let samples = samples.max(2);
        Self {
            threshold_mb,
            samples,
            history: VecDeque::with_capacity(samples),
        }
    }

    /// 记录一次采样并返回当前是否疑似泄漏
    pub fn observe(&mut self, used_mb: f64) -> bool {
        if self.history.len() == self.samples {
            self.history.pop_front();
        }
        self.history.push_back(used_mb);

        if self.history.len() < self.samples {
            return false;
        }

        let monotonic = self
            .history
            .iter()
            .zip(self.history.iter().skip(1))
            .all(|(prev, next)| next > prev);
        let growth = match (self.history.front(), self.history.back()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };

        let leaking = monotonic && growth > self.threshold_mb;
        if leaking {
            warn!(
                "疑似内存泄漏: 最近 {} 次采样增长 {:.1}MB (阈值 {:.1}MB)",
                self.samples, growth, self.threshold_mb
            );
        }
        leaking
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kb_field() {
        let status = "Name:\ttaskgate\nVmRSS:\t   20480 kB\nThreads:\t4\n";
        assert_eq!(parse_kb_field(status, "VmRSS:"), Some(20480));
        assert_eq!(parse_kb_field(status, "VmSwap:"), None);
        assert_eq!(kb_to_mb(20480), 20.0);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_leak_detector_requires_monotonic_growth() {
        let mut detector = MemoryLeakDetector::new(10.0, 3);
        assert!(!detector.observe(100.0));
        assert!(!detector.observe(105.0));
        assert!(detector.observe(115.0));

        // 出现回落后不再判定为泄漏
        assert!(!detector.observe(110.0));
    }

    #[test]
    fn test_leak_detector_ignores_small_growth() {
        let mut detector = MemoryLeakDetector::new(50.0, 3);
        detector.observe(100.0);
        detector.observe(101.0);
        assert!(!detector.observe(102.0));
    }

    #[test]
    fn test_monitor_sample() {
        let monitor = ResourceMonitor::new();
        let sample = monitor.sample();
        assert!(sample.used_mb >= 0.0);
        assert!(sample.total_mb >= 0.0);
    }
}
