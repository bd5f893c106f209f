//! Monotonic millisecond time source.

#[cfg(test)]
mod test;

use std::sync::Arc;
use std::time::Duration;

/// Monotonic millisecond clock.
///
/// Engines take the clock as `Arc<dyn Clock>`, so hosts may substitute
/// their own source (a simulation clock, a tickless test clock) through the
/// `with_clock` constructors.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.
    ///
    /// Must never go backwards. The origin is unspecified; only differences
    /// between readings are meaningful.
    fn now_ms(&self) -> u64;
}

/// System monotonic clock.
///
/// Reads `CLOCK_MONOTONIC` on unix targets and falls back to
/// [`std::time::Instant`] elsewhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

#[cfg(unix)]
impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Cannot fail for CLOCK_MONOTONIC with a valid timespec pointer.
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(ret, 0);
        ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
    }
}

#[cfg(not(unix))]
impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;

        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
    }
}

pub(crate) fn default_clock() -> Arc<dyn Clock> {
    Arc::new(MonotonicClock)
}

pub(crate) fn ms_duration(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Hand-driven clock for deterministic tests.
#[cfg(test)]
pub(crate) struct ManualClock(std::sync::atomic::AtomicU64);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn at(start_ms: u64) -> Arc<Self> {
        Arc::new(Self(std::sync::atomic::AtomicU64::new(start_ms)))
    }

    pub(crate) fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
