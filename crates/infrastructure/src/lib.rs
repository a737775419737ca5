pub mod cleanup_service;
pub mod database;
pub mod error_handling;
pub mod resource_monitor;

pub use cleanup_service::{CleanupService, CleanupStats};
pub use database::{DatabaseManager, SqlitePools};
pub use resource_monitor::{process_alive, MemoryLeakDetector, MemorySample, ResourceMonitor};
