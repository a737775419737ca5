pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod models;
pub mod traits;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, Permit,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use models::*;
pub use taskgate_errors::{QueueError, QueueResult};
pub use traits::*;
