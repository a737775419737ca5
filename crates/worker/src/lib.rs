//! 文件系统和网络的真实实现，以及把常用操作接入队列的透明适配器

pub mod adapter;
pub mod executors;
pub mod filesystem;
pub mod network;

pub use adapter::TransparentAdapter;
pub use executors::FnExecutor;
pub use filesystem::{wildcard_match, TokioFileSystem};
pub use network::HttpNetwork;
