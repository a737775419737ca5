use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::gauge;
use taskgate_core::{CircuitState, ResourceGroup, SessionCounters};

/// 引擎级计数器，心跳和会话计数都从这里读取
#[derive(Debug, Default)]
pub struct EngineCounters {
    submitted: AtomicU64,
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// 单次执行尝试成功
    pub fn record_attempt_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// 单次执行尝试失败
    pub fn record_attempt_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 任务进入终态
    pub fn record_terminal(&self, succeeded: bool) {
        if succeeded {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 任务在完成前被取消
    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tasks_cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn tasks_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn session_counters(&self) -> SessionCounters {
        SessionCounters {
            total_tasks: self.submitted.load(Ordering::Relaxed),
            completed_tasks: self.completed.load(Ordering::Relaxed),
            failed_tasks: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// 资源组调度器发布的实时状态
///
/// 只由对应的调度器写入，状态查询无需经过调度器即可读取。
#[derive(Debug)]
pub struct GroupGauges {
    resource_group: ResourceGroup,
    queued: AtomicUsize,
    delayed: AtomicUsize,
    running: AtomicUsize,
    breaker_state: AtomicU8,
}

impl GroupGauges {
    pub fn new(resource_group: ResourceGroup) -> Arc<Self> {
        Arc::new(Self {
            resource_group,
            queued: AtomicUsize::new(0),
            delayed: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            breaker_state: AtomicU8::new(CircuitState::Closed.as_u8()),
        })
    }

    pub fn resource_group(&self) -> ResourceGroup {
        self.resource_group
    }

    pub fn publish(&self, queued: usize, delayed: usize, running: usize, state: CircuitState) {
        self.queued.store(queued, Ordering::Relaxed);
        self.delayed.store(delayed, Ordering::Relaxed);
        self.running.store(running, Ordering::Relaxed);
        self.breaker_state.store(state.as_u8(), Ordering::Relaxed);

        let group = self.resource_group.as_str();
        gauge!("taskgate_queue_depth", "resource_group" => group).set((queued + delayed) as f64);
        gauge!("taskgate_running_tasks", "resource_group" => group).set(running as f64);
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn delayed(&self) -> usize {
        self.delayed.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn circuit_state(&self) -> CircuitState {
        CircuitState::from_u8(self.breaker_state.load(Ordering::Relaxed))
    }
}
