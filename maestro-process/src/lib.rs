//! ABOUTME: Managed external process execution for maestro
//! ABOUTME: Queueing with ETA, bounded capture, timeouts, retries, rate limiting

pub mod limiter;
pub mod manager;
pub mod output;
pub mod retry;
pub mod types;

pub use limiter::{RateLimitConfig, RateLimiter};
pub use manager::{ProcessManager, ProcessManagerConfig};
pub use output::BoundedBuffer;
pub use retry::RetryConfig;
pub use types::{ProcessConfig, ProcessState, ProcessStatus};
