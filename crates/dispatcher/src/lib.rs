//! 队列调度
//!
//! 每个资源组一个调度 actor，由 [`QueueEngine`] 统一路由任务、
//! 管理会话生命周期以及心跳、指标和清理等后台服务。

pub mod engine;
mod group_scheduler;
pub mod heartbeat;
pub mod metrics_reporter;
pub mod retry;
pub mod session_manager;
pub mod stats;

pub use engine::{GroupStatus, QueueEngine, QueueStatus, TaskHandle};
pub use heartbeat::{HeartbeatService, HeartbeatWriter};
pub use metrics_reporter::{MetricsReporter, MetricsService};
pub use retry::RetryPolicy;
pub use session_manager::SessionManager;
pub use stats::{EngineCounters, GroupGauges};
