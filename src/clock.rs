//! Injected time source.
//!
//! The reference implementation this system is modeled on keeps a singleton
//! background thread that caches the current time for every other component
//! to read. We replace that with an explicit `Clock` handed to whatever
//! needs it - a [`SystemClock`] in production, a fake clock in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of monotonic-enough wall-clock time, in microseconds since the
/// Unix epoch.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// The real clock: reads `SystemTime::now()` on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A clock for tests: starts at zero, advances only when told to.
#[derive(Debug, Default)]
pub struct FakeClock {
    micros: AtomicU64,
}

impl FakeClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            micros: AtomicU64::new(start_micros),
        }
    }

    pub fn advance(&self, delta_micros: u64) {
        self.micros.fetch_add(delta_micros, Ordering::Relaxed);
    }
}

impl Clock for FakeClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::Relaxed)
    }
}
