pub mod app;
pub mod shutdown;

pub use app::{AppCommand, Application};
pub use shutdown::ShutdownManager;
