//! Pure token bucket decision logic.
//!
//! [`decide_consume`] is the whole algorithm behind `consume`: given the stored
//! bucket (if any), the call parameters and the caller's clock, it computes the
//! grant and the write the store must apply. The store script only loads,
//! calls this, and persists, so the decision is the same no matter which
//! process runs it.
//!
//! # Tiger Style
//!
//! - Time is passed explicitly
//! - Saturating arithmetic on timestamps
//! - `0 <= count <= max` holds for every snapshot produced

use crate::types::BucketSnapshot;
use crate::types::RateLimitParams;
use crate::types::TokenGrant;

/// What the store must do with the bucket after a call.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketWrite {
    /// Replace the stored fields with this snapshot.
    Persist(BucketSnapshot),
    /// Delete all state; the next call sees a fresh bucket.
    Reset,
}

/// Full result of one `consume` decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeDecision {
    pub grant: TokenGrant,
    pub write: BucketWrite,
}

/// Compute refilled tokens after `elapsed_ms`, bounded by `max`.
#[inline]
pub fn refill(count: f64, max: f64, rate: f64, elapsed_ms: u64, interval_ms: u64) -> f64 {
    if count >= max {
        return count.min(max);
    }
    let interval = interval_ms.max(1) as f64;
    let refilled = count + rate.max(0.0) * elapsed_ms as f64 / interval;
    refilled.min(max)
}

/// Advisory wait until one whole token is back.
///
/// The wait is the time for refill to cover the deficit, capped by what is
/// left of the current interval when that is shorter. Never 0: a 0 delay means
/// admission.
#[inline]
pub fn compute_delay_ms(count: f64, rate: f64, elapsed_ms: u64, interval_ms: u64) -> u64 {
    let window_left = interval_ms.saturating_sub(elapsed_ms);
    if rate <= 0.0 {
        return window_left.max(1);
    }
    let deficit = (1.0 - count).max(0.0);
    let token_wait = (deficit * interval_ms as f64 / rate).ceil() as u64;
    let delay = if window_left > 0 { token_wait.min(window_left) } else { token_wait };
    delay.max(1)
}

/// Next backed-off interval, or `None` if the multiplier cannot grow it.
#[inline]
pub fn grow_interval(interval_ms: u64, multiplier: f64, max_interval_ms: u64) -> Option<u64> {
    let factor = multiplier.abs();
    if factor <= 1.0 {
        return None;
    }
    let grown = (interval_ms as f64 * factor).ceil();
    let ceiling = max_interval_ms.max(interval_ms) as f64;
    Some(grown.min(ceiling) as u64)
}

/// Decide the outcome of one `consume` call.
pub fn decide_consume(stored: Option<&BucketSnapshot>, params: &RateLimitParams, now_ms: u64) -> ConsumeDecision {
    let max = params.max.max(0.0);
    let uses_backoff = params.backoff_multiplier != 0.0;

    let stored_interval = stored.and_then(|s| s.last_interval_ms).filter(|_| uses_backoff);
    let interval_ms = stored_interval.unwrap_or(params.interval_ms).max(1);

    let (count, mut last_refill_ms, previous_total) = match stored {
        Some(s) => (s.count.clamp(0.0, max), s.last_refill_ms, s.total_requests),
        None => (max, now_ms, 0),
    };

    // Clock went backwards relative to the last writer: treat it as exactly
    // one interval elapsed so refill stays bounded.
    if now_ms < last_refill_ms {
        last_refill_ms = now_ms.saturating_sub(interval_ms);
    }
    let elapsed_ms = now_ms.saturating_sub(last_refill_ms);
    let count = refill(count, max, params.rate, elapsed_ms, interval_ms);
    let total = previous_total.saturating_add(1);

    if count < 1.0 {
        let persisted_interval = if uses_backoff {
            grow_interval(interval_ms, params.backoff_multiplier, params.max_interval_ms).or(stored_interval)
        } else {
            None
        };
        let write = if params.reset_after > 0 {
            BucketWrite::Reset
        } else {
            BucketWrite::Persist(BucketSnapshot {
                count,
                last_refill_ms: now_ms,
                last_interval_ms: persisted_interval,
                total_requests: total,
            })
        };
        return ConsumeDecision {
            grant: TokenGrant {
                delay_ms: compute_delay_ms(count, params.rate, elapsed_ms, interval_ms),
                count,
                total,
                elapsed_ms,
                interval_ms,
                is_fail_open: false,
            },
            write,
        };
    }

    let remaining = count - 1.0;
    let write = if params.reset_after > 1 && total >= params.reset_after {
        BucketWrite::Reset
    } else {
        let last_interval_ms = if params.backoff_multiplier < 0.0 { None } else { stored_interval };
        BucketWrite::Persist(BucketSnapshot {
            count: remaining,
            last_refill_ms: now_ms,
            last_interval_ms,
            total_requests: total,
        })
    };
    ConsumeDecision {
        grant: TokenGrant {
            delay_ms: 0,
            count: remaining,
            total,
            elapsed_ms,
            interval_ms,
            is_fail_open: false,
        },
        write,
    }
}
