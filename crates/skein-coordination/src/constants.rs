//! Fixed limits and defaults for coordination primitives.

/// Default delay between poll cycles after a message was handled (ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default delay before polling again after an empty poll or a store error (ms).
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Default lease duration for a channel (ms). Zero selects non-leased mode.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on how far ahead a not-yet-due message is parked (ms).
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Leases are renewed once this fraction of the lease has elapsed.
pub const LEASE_RENEWAL_FRACTION: f64 = 0.8;

/// Floor on the renewal period so tiny leases do not spin (ms).
pub const MIN_LEASE_RENEWAL_PERIOD_MS: u64 = 10;

/// Maximum expired leases revived by a single monitor script.
pub const MAX_MONITOR_BATCH: u32 = 1_000;

/// Score gap between consecutive revived messages (ms).
///
/// Kept above f64 resolution at current epoch-millisecond magnitudes. A sweep
/// of `n` entries spreads them over the `n * step` ms before now.
pub const REVIVE_SCORE_STEP_MS: f64 = 0.001;

/// Default ceiling for a progressively backed-off limiter interval (ms).
pub const DEFAULT_MAX_BACKOFF_INTERVAL_MS: u64 = 86_400_000;

/// Handler status codes at or above this value are retried.
pub const RETRYABLE_STATUS_MIN: u16 = 500;

/// Default namespace prefixed to every key.
pub const DEFAULT_NAMESPACE: &str = "skein";
