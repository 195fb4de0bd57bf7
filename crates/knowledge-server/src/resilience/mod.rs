pub mod circuit_breaker;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::CircuitBreaker;
pub use pipeline::{Pipelines, ResiliencePipeline};
pub use rate_limiter::{RateLimitVerdict, RateLimiterRegistry};
pub use retry::RetryPolicy;
