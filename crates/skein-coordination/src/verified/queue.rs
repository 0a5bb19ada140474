//! Pure lease and delivery decisions for the work queue.
//!
//! All times are Unix milliseconds supplied by the caller.

use crate::constants::LEASE_RENEWAL_FRACTION;
use crate::constants::MIN_LEASE_RENEWAL_PERIOD_MS;
use crate::constants::RETRYABLE_STATUS_MIN;
use crate::constants::REVIVE_SCORE_STEP_MS;

/// Lease duration for a message: its own override, else the channel default.
/// 0 means the message is not leased.
#[inline]
pub fn effective_lease_ms(message_override: Option<u64>, channel_visibility_timeout_ms: u64) -> u64 {
    message_override.unwrap_or(channel_visibility_timeout_ms)
}

/// How often a held lease is renewed.
///
/// Always shorter than the lease itself once the lease is at least 2 ms, so
/// the first renewal lands before the deadline.
#[inline]
pub fn heartbeat_period_ms(lease_ms: u64) -> u64 {
    let period = (lease_ms as f64 * LEASE_RENEWAL_FRACTION).floor() as u64;
    let floor = MIN_LEASE_RENEWAL_PERIOD_MS.min(lease_ms.saturating_sub(1));
    period.max(floor).max(1)
}

/// In-flight deadline for a message that is not due yet.
#[inline]
pub fn defer_deadline_ms(start_time_ms: u64, now_ms: u64, max_timeout_ms: u64) -> u64 {
    start_time_ms.min(now_ms.saturating_add(max_timeout_ms))
}

/// What to do with a message right after it was leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    /// `endTime` has passed: drop without delivering.
    Expire,
    /// `startTime` is still ahead: park in-flight until `until_ms`.
    Defer { until_ms: u64 },
    /// Hand to the channel handler.
    Deliver,
}

/// Classify a freshly leased message against its scheduling window.
#[inline]
pub fn classify_leased(
    start_time_ms: Option<u64>,
    end_time_ms: Option<u64>,
    now_ms: u64,
    max_timeout_ms: u64,
) -> LeaseAction {
    if let Some(end) = end_time_ms
        && end <= now_ms
    {
        return LeaseAction::Expire;
    }
    if let Some(start) = start_time_ms
        && start > now_ms
    {
        return LeaseAction::Defer {
            until_ms: defer_deadline_ms(start, now_ms, max_timeout_ms),
        };
    }
    LeaseAction::Deliver
}

/// Score at which a failed message becomes visible again.
///
/// First match wins: the message's per-status timeout, the channel's
/// per-status timeout, the lease duration, the channel retry interval.
#[inline]
pub fn retry_deadline_ms(
    now_ms: u64,
    message_status_timeout_ms: Option<u64>,
    channel_status_timeout_ms: Option<u64>,
    lease_ms: u64,
    retry_interval_ms: u64,
) -> u64 {
    let wait = message_status_timeout_ms
        .or(channel_status_timeout_ms)
        .unwrap_or(if lease_ms > 0 { lease_ms } else { retry_interval_ms });
    now_ms.saturating_add(wait)
}

/// Ready scores for one batch of a sweep that revives `total` messages.
///
/// The batch holds the messages at positions `start..start + count` of the
/// sweep, in deadline order. Position `p` gets `now - (total - 1 - p) * step`,
/// so scores stay distinct and increasing across batches, and the last
/// message of the sweep lands exactly on `now`.
pub fn revive_scores(now_ms: u64, total: u64, start: u64, count: usize) -> Vec<f64> {
    let now = now_ms as f64;
    let last = total.saturating_sub(1);
    (0..count as u64)
        .map(|i| now - last.saturating_sub(start.saturating_add(i)) as f64 * REVIVE_SCORE_STEP_MS)
        .collect()
}

/// Final fate of a delivered message once the handler reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Handler succeeded: remove.
    Complete,
    /// Requeue with a retry deadline.
    Retry,
    /// Non-retryable failure: remove.
    Reject,
    /// Retry cap reached: remove and dead-letter if configured.
    RetriesExhausted,
}

/// True if a handler status asks for redelivery.
#[inline]
pub fn is_retryable_status(status: u16) -> bool {
    status >= RETRYABLE_STATUS_MIN
}

/// Decide the disposition of a handler result.
///
/// `failure_status` is `None` on success. Fire-and-forget messages are retried
/// on any failure.
#[inline]
pub fn ack_disposition(
    failure_status: Option<u16>,
    no_wait: bool,
    retry_count: u32,
    max_retries: Option<u32>,
) -> AckDisposition {
    let Some(status) = failure_status else {
        return AckDisposition::Complete;
    };
    if !no_wait && !is_retryable_status(status) {
        return AckDisposition::Reject;
    }
    match max_retries {
        Some(max) if retry_count >= max => AckDisposition::RetriesExhausted,
        _ => AckDisposition::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_override_wins() {
        assert_eq!(effective_lease_ms(Some(100), 5000), 100);
        assert_eq!(effective_lease_ms(None, 5000), 5000);
        assert_eq!(effective_lease_ms(Some(0), 5000), 0);
    }

    #[test]
    fn heartbeat_is_four_fifths_with_floor() {
        assert_eq!(heartbeat_period_ms(5000), 4000);
        assert_eq!(heartbeat_period_ms(12), 10);
        assert_eq!(heartbeat_period_ms(5), 4);
        assert_eq!(heartbeat_period_ms(2), 1);
        assert_eq!(heartbeat_period_ms(0), 1);
    }

    #[test]
    fn heartbeat_renews_before_short_leases_end() {
        for lease in 2..=50 {
            assert!(heartbeat_period_ms(lease) < lease, "lease {lease}");
        }
    }

    #[test]
    fn classify_window() {
        assert_eq!(classify_leased(None, Some(100), 100, 1000), LeaseAction::Expire);
        assert_eq!(classify_leased(Some(150), None, 100, 1000), LeaseAction::Defer { until_ms: 150 });
        assert_eq!(classify_leased(Some(5000), None, 100, 1000), LeaseAction::Defer { until_ms: 1100 });
        assert_eq!(classify_leased(Some(100), Some(200), 100, 1000), LeaseAction::Deliver);
        // Expiry beats a future start.
        assert_eq!(classify_leased(Some(500), Some(50), 100, 1000), LeaseAction::Expire);
    }

    #[test]
    fn retry_deadline_precedence() {
        assert_eq!(retry_deadline_ms(1000, Some(5), Some(7), 9, 11), 1005);
        assert_eq!(retry_deadline_ms(1000, None, Some(7), 9, 11), 1007);
        assert_eq!(retry_deadline_ms(1000, None, None, 9, 11), 1009);
        assert_eq!(retry_deadline_ms(1000, None, None, 0, 11), 1011);
    }

    #[test]
    fn revive_scores_are_increasing_and_not_after_now() {
        let scores = revive_scores(10_000, 4, 0, 4);
        assert_eq!(scores.len(), 4);
        assert_eq!(*scores.last().unwrap(), 10_000.0);
        assert!(scores.windows(2).all(|w| w[0] < w[1]));
        assert!(revive_scores(5, 0, 0, 0).is_empty());
    }

    #[test]
    fn revive_batches_continue_where_the_previous_stopped() {
        let whole = revive_scores(1_700_000_000_000, 7, 0, 7);
        let mut batched = revive_scores(1_700_000_000_000, 7, 0, 3);
        batched.extend(revive_scores(1_700_000_000_000, 7, 3, 3));
        batched.extend(revive_scores(1_700_000_000_000, 7, 6, 1));
        assert_eq!(batched, whole);
        assert!(batched.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn dispositions() {
        assert_eq!(ack_disposition(None, false, 0, None), AckDisposition::Complete);
        assert_eq!(ack_disposition(Some(503), false, 0, None), AckDisposition::Retry);
        assert_eq!(ack_disposition(Some(404), false, 0, None), AckDisposition::Reject);
        assert_eq!(ack_disposition(Some(404), true, 0, None), AckDisposition::Retry);
        assert_eq!(ack_disposition(Some(500), false, 1_000, None), AckDisposition::Retry);
        assert_eq!(ack_disposition(Some(500), false, 2, Some(3)), AckDisposition::Retry);
        assert_eq!(ack_disposition(Some(500), false, 3, Some(3)), AckDisposition::RetriesExhausted);
    }
}
