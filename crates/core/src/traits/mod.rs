pub mod collaborators;
pub mod executor;
pub mod repository;

pub use collaborators::{DirEntryInfo, FileSystemOperations, HttpResponse, NetworkOperations};
pub use executor::{TaskExecutionContext, TaskExecutor, TaskSubmitter};
pub use repository::{
    CircuitBreakerRepository, HeartbeatRepository, MetricsRepository, QueueRepositories,
    SessionRepository, TaskRepository,
};
