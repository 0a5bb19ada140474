//! Pure decision functions for the coordination primitives.
//!
//! This module is the functional core. Every function here is deterministic:
//! no I/O, no clock reads, time passed in as a parameter. The imperative shell
//! (store scripts, poll loops, background tasks) calls into it so the rules can
//! be tested without a store.
//!
//! # Module Organization
//!
//! - [`rate_limiter`]: token bucket refill, delay, backoff and reset policy
//! - [`queue`]: lease durations, scheduling windows, retry deadlines, revival
//!
//! # Tiger Style
//!
//! - Saturating arithmetic on timestamps (no panics)
//! - Explicit types (u64, u32, not usize) in the decision inputs

pub mod queue;
pub mod rate_limiter;

pub use queue::AckDisposition;
pub use queue::LeaseAction;
pub use queue::ack_disposition;
pub use queue::classify_leased;
pub use queue::defer_deadline_ms;
pub use queue::effective_lease_ms;
pub use queue::heartbeat_period_ms;
pub use queue::is_retryable_status;
pub use queue::retry_deadline_ms;
pub use queue::revive_scores;
pub use rate_limiter::BucketWrite;
pub use rate_limiter::ConsumeDecision;
pub use rate_limiter::compute_delay_ms;
pub use rate_limiter::decide_consume;
pub use rate_limiter::grow_interval;
pub use rate_limiter::refill;
