pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod shutdown;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use rate_limiter::RateLimiter;
pub use retry::{with_retry, RetryConfig};
pub use shutdown::GracefulShutdown;
