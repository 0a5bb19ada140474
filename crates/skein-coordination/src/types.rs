//! Shared types for coordination primitives.

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_MAX_BACKOFF_INTERVAL_MS;

/// Parameters of a single `consume` call against a token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitParams {
    /// Tokens added per `interval_ms`.
    pub rate: f64,
    /// Bucket capacity. A fresh bucket starts full.
    pub max: f64,
    /// Refill interval in milliseconds.
    pub interval_ms: u64,
    /// Expiration refreshed on every call (0 = never expires).
    pub ttl_ms: u64,
    /// Reset policy. On exhaustion any value > 0 wipes the bucket; on success
    /// a value > 1 wipes it once `total` reaches it.
    pub reset_after: u64,
    /// Progressive backoff factor (0 = off). On exhaustion the interval grows
    /// by `|multiplier|`; a negative value also clears the grown interval on
    /// the next success.
    pub backoff_multiplier: f64,
    /// Ceiling for the grown interval.
    pub max_interval_ms: u64,
}

impl RateLimitParams {
    /// `rate` tokens per `interval_ms`, bursting up to `max`.
    pub fn new(rate: f64, max: f64, interval_ms: u64) -> Self {
        Self {
            rate,
            max,
            interval_ms,
            ttl_ms: 0,
            reset_after: 0,
            backoff_multiplier: 0.0,
            max_interval_ms: DEFAULT_MAX_BACKOFF_INTERVAL_MS,
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_reset_after(mut self, reset_after: u64) -> Self {
        self.reset_after = reset_after;
        self
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval_ms: u64) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_interval_ms = max_interval_ms;
        self
    }
}

/// Stored token bucket state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    /// Tokens currently in the bucket (fractional).
    pub count: f64,
    /// Time of the last update (Unix ms).
    pub last_refill_ms: u64,
    /// Backed-off interval, if progressive backoff has grown it.
    pub last_interval_ms: Option<u64>,
    /// Number of `consume` calls since the bucket was created.
    pub total_requests: u64,
}

/// Outcome of a `consume` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// Advisory wait before the next token is available (0 = admitted).
    pub delay_ms: u64,
    /// Tokens left after this call.
    pub count: f64,
    /// Calls counted against the bucket, including this one.
    pub total: u64,
    /// Time since the previous update used for refill.
    pub elapsed_ms: u64,
    /// Interval in effect for this call.
    pub interval_ms: u64,
    /// Set when the limiter could not reach the store and admitted anyway.
    #[serde(default)]
    pub is_fail_open: bool,
}

impl TokenGrant {
    /// True if the caller may proceed now.
    pub fn is_admitted(&self) -> bool {
        self.delay_ms == 0
    }
}
