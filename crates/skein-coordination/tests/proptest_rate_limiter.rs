//! Property-based tests for the token bucket and queue decision functions.
//!
//! Tests cover invariants for:
//! - Token bucket: admission bound over any window, cold start burst, clock skew
//! - Revival: ready scores stay ordered and never land in the future
//! - Lease renewal: the heartbeat fires before the lease ends
//!
//! # Tiger Style
//!
//! - All tests use bounded inputs from generators
//! - Pure functions only, no store or runtime

use proptest::prelude::*;
use skein_coordination::BucketSnapshot;
use skein_coordination::RateLimitParams;
use skein_coordination::verified::BucketWrite;
use skein_coordination::verified::ConsumeDecision;
use skein_coordination::verified::decide_consume;
use skein_coordination::verified::heartbeat_period_ms;
use skein_coordination::verified::revive_scores;

// =============================================================================
// Generators
// =============================================================================

fn params() -> impl Strategy<Value = RateLimitParams> {
    (1u32..50, 1u32..50, 1u64..10_000).prop_map(|(rate, max, interval)| {
        RateLimitParams::new(rate as f64, max as f64, interval)
    })
}

/// Gaps between consecutive calls, in ms. Zero gaps model bursts.
fn gaps() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(prop_oneof![Just(0u64), 0u64..50, 0u64..5_000], 1..120)
}

fn snapshot() -> impl Strategy<Value = BucketSnapshot> {
    (0u32..100, 0u64..1_000_000, 0u64..1_000).prop_map(|(count, last_refill_ms, total)| BucketSnapshot {
        count: count as f64,
        last_refill_ms,
        last_interval_ms: None,
        total_requests: total,
    })
}

/// Apply a sequence of calls to one bucket, returning (time, decision) pairs.
fn run_calls(params: &RateLimitParams, start_ms: u64, gaps: &[u64]) -> Vec<(u64, ConsumeDecision)> {
    let mut state: Option<BucketSnapshot> = None;
    let mut now = start_ms;
    let mut out = Vec::with_capacity(gaps.len());
    for gap in gaps {
        now += gap;
        let decision = decide_consume(state.as_ref(), params, now);
        state = match &decision.write {
            BucketWrite::Persist(s) => Some(s.clone()),
            BucketWrite::Reset => None,
        };
        out.push((now, decision));
    }
    out
}

// =============================================================================
// Token Bucket Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Admissions in any window [t_i, t_j] never exceed max + rate * T / interval.
    #[test]
    fn test_proptest_admissions_bounded_in_every_window(params in params(), gaps in gaps()) {
        let calls = run_calls(&params, 1_000_000, &gaps);
        for i in 0..calls.len() {
            let mut admitted = 0u64;
            for (t_j, decision) in &calls[i..] {
                if decision.grant.is_admitted() {
                    admitted += 1;
                }
                let window = (t_j - calls[i].0) as f64;
                let bound = params.max + params.rate * window / params.interval_ms as f64;
                prop_assert!(
                    admitted as f64 <= bound + 1e-6,
                    "admitted {} > bound {} over {}ms", admitted, bound, window
                );
            }
        }
    }

    /// A fresh bucket admits exactly `max` immediate calls, then asks to wait.
    #[test]
    fn test_proptest_cold_start_burst(params in params(), now in 0u64..u64::MAX / 2) {
        let max = params.max as usize;
        let calls = run_calls(&params, now, &vec![0; max + 1]);
        for (_, decision) in &calls[..max] {
            prop_assert_eq!(decision.grant.delay_ms, 0);
        }
        prop_assert!(calls[max].1.grant.delay_ms > 0);
    }

    /// A clock behind the stored update time refills for exactly one interval.
    #[test]
    fn test_proptest_clock_skew_is_bounded(
        params in params(),
        stored in snapshot(),
        behind in 1u64..1_000_000,
    ) {
        prop_assume!(stored.last_refill_ms >= behind);
        let now = stored.last_refill_ms - behind;
        let decision = decide_consume(Some(&stored), &params, now);
        prop_assert_eq!(decision.grant.elapsed_ms, params.interval_ms.min(now));
        prop_assert!(decision.grant.count >= 0.0);
        prop_assert!(decision.grant.count <= params.max);
        if let BucketWrite::Persist(s) = decision.write {
            prop_assert_eq!(s.last_refill_ms, now);
        }
    }

    /// Persisted count always stays within [0, max].
    #[test]
    fn test_proptest_count_stays_in_range(params in params(), gaps in gaps()) {
        for (_, decision) in run_calls(&params, 0, &gaps) {
            prop_assert!(decision.grant.count >= 0.0);
            prop_assert!(decision.grant.count <= params.max);
            prop_assert_eq!(decision.grant.is_admitted(), decision.grant.delay_ms == 0);
        }
    }
}

// =============================================================================
// Revival Properties
// =============================================================================

proptest! {
    /// Scores from a sweep split into batches are strictly increasing and end at `now`.
    #[test]
    fn test_proptest_revive_scores_ordered_not_future(
        now in 1_000_000u64..2_000_000_000_000,
        n in 0usize..3_000,
        batch in 1usize..1_000,
    ) {
        let mut scores = Vec::with_capacity(n);
        while scores.len() < n {
            let count = batch.min(n - scores.len());
            scores.extend(revive_scores(now, n as u64, scores.len() as u64, count));
        }
        prop_assert_eq!(scores.len(), n);
        prop_assert!(scores.iter().all(|s| *s <= now as f64));
        prop_assert!(scores.windows(2).all(|w| w[0] < w[1]));
        if let Some(last) = scores.last() {
            prop_assert_eq!(*last, now as f64);
        }
    }

    /// A lease of at least 2 ms is renewed before it runs out.
    #[test]
    fn test_proptest_heartbeat_precedes_deadline(lease in 2u64..10_000_000) {
        let period = heartbeat_period_ms(lease);
        prop_assert!(period >= 1);
        prop_assert!(period < lease);
    }
}
