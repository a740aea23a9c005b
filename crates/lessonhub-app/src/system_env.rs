//! Production environment on tokio's clock and OS randomness.
//!
//! Time comes from `tokio::time::Instant`, so a runtime started with a paused
//! clock (`tokio::time::pause`) runs the real event loop under virtual time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lessonhub_core::Environment;

/// Production environment.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. Jitter without entropy would
/// synchronize reconnect storms across clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG is available");
    }
}
