//! Network layer: pacing, circuit breaking, and the HTTP executor.
//!
//! The [`HttpExecutor`] is the only way the rest of the crate talks to
//! the network. It composes the per-provider [`RateLimiter`] and
//! [`BreakerRegistry`] with bounded-attempt retries and streaming budget
//! enforcement.

mod breaker;
mod error;
mod executor;
mod rate_limit;

pub use breaker::{Admission, Breaker, BreakerMode, BreakerRegistry};
pub use error::FetchError;
pub use executor::{parse_retry_after, partial_path, HttpExecutor, Payload, PARTIAL_SUFFIX};
pub use rate_limit::RateLimiter;
