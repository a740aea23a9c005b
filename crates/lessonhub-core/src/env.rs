//! Environment abstraction for deterministic testing.
//!
//! Decouples chat state machines from system resources (time, randomness).
//! Production code runs on tokio's clock and OS entropy; simulation uses a
//! virtual clock and a seeded RNG so typing expiry, switch debouncing and
//! reconnection backoff are reproducible.

use std::{
    fmt::Debug,
    future::Future,
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic instant usable by the chat state machines.
///
/// Blanket-implemented for every type with the required arithmetic, which
/// covers `std::time::Instant`, `tokio::time::Instant` and virtual instants.
pub trait Instant:
    Copy + Ord + Debug + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

impl<T> Instant for T where
    T: Copy + Ord + Debug + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = T>
{
}

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - Given the same seed, a simulated `random_bytes()` yields the same sequence
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    type Instant: Instant;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Wall clock in milliseconds since the Unix epoch.
    ///
    /// Used to timestamp optimistic messages before the server assigns the
    /// authoritative timestamp.
    fn wall_clock_millis(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this; state machines take `now` as input.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
