//! Clock access for skein coordination primitives.
//!
//! Every deadline the coordination layer computes (lease deadlines, lock TTLs,
//! token refill) is expressed in Unix milliseconds and read through a
//! [`TimeProvider`]. Production code uses [`SystemTimeProvider`]; tests swap in
//! [`SimulatedTimeProvider`] (behind the `simulation` feature) so that lease
//! expiry and bucket refill can be driven without sleeping.
//!
//! Reads never panic: a system clock set before the Unix epoch yields 0.

use std::sync::Arc;
#[cfg(feature = "simulation")]
use std::sync::atomic::AtomicU64;
#[cfg(feature = "simulation")]
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Current Unix timestamp in milliseconds (0 if the clock predates the epoch).
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Current Unix timestamp in whole seconds.
#[inline]
pub fn current_time_secs() -> u64 {
    current_time_ms() / 1000
}

/// Source of wall-clock time.
///
/// Implementations must be cheap to call; the queue consumer reads the clock
/// several times per poll cycle.
pub trait TimeProvider: Send + Sync {
    /// Current Unix timestamp in milliseconds.
    fn now_unix_ms(&self) -> u64;

    /// Current Unix timestamp in seconds.
    fn now_unix_secs(&self) -> u64 {
        self.now_unix_ms() / 1000
    }
}

impl<T: TimeProvider + ?Sized> TimeProvider for Arc<T> {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        (**self).now_unix_ms()
    }
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying counter, so a test can hand one clone to
/// the store and another to the consumer and advance both at once.
///
/// ```ignore
/// let clock = SimulatedTimeProvider::new(10_000);
/// clock.advance_ms(6_000);
/// assert_eq!(clock.now_unix_ms(), 16_000);
/// ```
#[cfg(feature = "simulation")]
#[derive(Debug, Clone)]
pub struct SimulatedTimeProvider {
    now_ms: Arc<AtomicU64>,
}

#[cfg(feature = "simulation")]
impl SimulatedTimeProvider {
    /// Create a clock frozen at `initial_ms`.
    pub fn new(initial_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(initial_ms)),
        }
    }

    /// Create a clock frozen at the current system time.
    pub fn from_system_time() -> Self {
        Self::new(current_time_ms())
    }

    /// Move the clock forward.
    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Move the clock forward by whole seconds.
    pub fn advance_secs(&self, delta_secs: u64) {
        self.advance_ms(delta_secs.saturating_mul(1000));
    }

    /// Jump to an absolute time. Moving backwards is allowed and is how tests
    /// exercise clock-skew handling.
    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

#[cfg(feature = "simulation")]
impl Default for SimulatedTimeProvider {
    fn default() -> Self {
        Self::from_system_time()
    }
}

#[cfg(feature = "simulation")]
impl TimeProvider for SimulatedTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}


#[cfg(all(test, feature = "simulation"))]
mod simulation_tests {
    use super::*;

    #[test]
    fn clones_share_time() {
        let clock = SimulatedTimeProvider::new(1_000);
        let other = clock.clone();
        clock.advance_ms(250);
        assert_eq!(other.now_unix_ms(), 1_250);
    }

    #[test]
    fn set_can_move_backwards() {
        let clock = SimulatedTimeProvider::new(5_000);
        clock.set_ms(4_000);
        assert_eq!(clock.now_unix_ms(), 4_000);
        clock.advance_secs(2);
        assert_eq!(clock.now_unix_secs(), 6);
    }
}
