pub mod circuit_breaker_repository;
pub mod heartbeat_repository;
pub mod metrics_repository;
pub mod session_repository;
pub mod task_repository;

pub use circuit_breaker_repository::SqliteCircuitBreakerRepository;
pub use heartbeat_repository::SqliteHeartbeatRepository;
pub use metrics_repository::SqliteMetricsRepository;
pub use session_repository::SqliteSessionRepository;
pub use task_repository::SqliteTaskRepository;
