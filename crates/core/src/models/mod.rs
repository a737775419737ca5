pub mod heartbeat;
pub mod metrics;
pub mod resource_group;
pub mod session;
pub mod task;

pub use heartbeat::ProcessHeartbeat;
pub use metrics::{
    success_rate, QueueMetrics, ResourceGroupPerformance, ResourceGroupStats, TaskAggregate,
};
pub use resource_group::{cpu_count, ResourceGroup, ResourceGroupLimits, LONG_RUNNING_THRESHOLD};
pub use session::{QueueSession, SessionCounters, SessionStatus, SessionSummary};
pub use task::{
    QueueTask, TaskOutcome, TaskRequest, TaskStatus, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
