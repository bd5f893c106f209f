//! Adaptive timeout supervisor.
//!
//! A [`Watchdog`] holds a set of timeout items and runs a single on-demand
//! tick whose period tracks the shortest registered timeout (half of it,
//! floored at [`MAX_WORK_PERIOD_MS`]). With no items registered nothing is
//! scheduled at all. Arming and disarming an item ([`Item::start`],
//! [`Item::cancel`]) are lock-free atomic operations, so they are safe in
//! hot paths. Once an armed item's elapsed time reaches its timeout, its
//! recovery callback runs on every tick until the item is cancelled or
//! removed.


use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::sched::Ticker;
use crate::time::{default_clock, Clock};

/// Smallest accepted timeout. Registering anything below this is a
/// programmer error and panics.
pub const MIN_TIMEOUT_MS: u64 = 200;

/// Ceiling on tick frequency: the adaptive period never drops below this.
pub const MAX_WORK_PERIOD_MS: u64 = MIN_TIMEOUT_MS / 2;

struct ItemShared {
    timeout_ms: u64,
    /// Published by `start` before `active`; the tick reads them in the
    /// opposite order (acquire on `active`) so the pair is consistent.
    start_time_ms: AtomicU64,
    active: AtomicBool,
    /// Authoritative lifetime flag: false means the item must neither be
    /// dispatched nor considered for period recomputation.
    valid: AtomicBool,
    recovery: Box<dyn Fn() + Send + Sync>,
    clock: Arc<dyn Clock>,
}

/// Cloneable handle to a watchdog item.
#[derive(Clone)]
pub struct Item {
    shared: Arc<ItemShared>,
}

impl Item {
    /// Arms the timeout. Start-once: calling again without an intervening
    /// [`cancel`][Self::cancel] keeps the original start time. Lock-free.
    pub fn start(&self) {
        let s = &self.shared;
        if s.active.load(Ordering::Acquire) {
            return;
        }
        s.start_time_ms.store(s.clock.now_ms(), Ordering::Relaxed);
        s.active.store(true, Ordering::Release);
    }

    /// Disarms the timeout. Lock-free.
    pub fn cancel(&self) {
        self.shared.active.store(false, Ordering::Relaxed);
    }

    /// True while the timeout is armed.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// The timeout this item was registered with.
    pub fn timeout_ms(&self) -> u64 {
        self.shared.timeout_ms
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    items: Mutex<Vec<Arc<ItemShared>>>,
    /// Current tick interval; zero while idle.
    period_ms: AtomicU64,
    work_active: AtomicBool,
    ticker: Ticker,
}

/// Timeout supervisor. See the [module docs][self].
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    /// Creates an idle watchdog: no items, no scheduled work.
    pub fn new() -> Self {
        Self::with_clock(default_clock())
    }

    /// Same as [`new`][Self::new] with a caller-supplied clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let body = Box::new(move || weak.upgrade().and_then(|inner| inner.tick()));
            Inner {
                clock: Arc::clone(&clock),
                items: Mutex::new(Vec::new()),
                period_ms: AtomicU64::new(0),
                work_active: AtomicBool::new(false),
                ticker: Ticker::new("watchdog", clock, body),
            }
        });
        Self { inner }
    }

    /// Registers a timeout item in the disarmed state and recomputes the
    /// tick period.
    ///
    /// # Panics
    ///
    /// Panics when `timeout_ms` is below [`MIN_TIMEOUT_MS`]. A caller
    /// violating the minimum is using the API incorrectly; the supervisor
    /// cannot meet its contract below it.
    pub fn add<F>(&self, timeout_ms: u64, recovery: F) -> Result<Item>
    where
        F: Fn() + Send + Sync + 'static,
    {
        assert!(
            timeout_ms >= MIN_TIMEOUT_MS,
            "watchdog timeout {timeout_ms}ms is below the {MIN_TIMEOUT_MS}ms minimum"
        );
        let shared = Arc::new(ItemShared {
            timeout_ms,
            start_time_ms: AtomicU64::new(0),
            active: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            recovery: Box::new(recovery),
            clock: Arc::clone(&self.inner.clock),
        });

        let mut items = self.inner.items.lock();
        items.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        items.push(Arc::clone(&shared));
        self.inner.recompute_period(&items);
        drop(items);

        debug!(timeout_ms, "watchdog item added");
        Ok(Item { shared })
    }

    /// Invalidates and detaches an item, then recomputes the tick period.
    /// An emptied registry cancels the tick.
    pub fn remove(&self, item: &Item) -> Result<()> {
        let mut items = self.inner.items.lock();
        let pos = items
            .iter()
            .position(|it| Arc::ptr_eq(it, &item.shared))
            .ok_or(Error::InvalidArgument("stale watchdog item handle"))?;
        // The tombstone goes in before the entry leaves the registry.
        items[pos].valid.store(false, Ordering::Release);
        items.remove(pos);
        self.inner.recompute_period(&items);
        drop(items);

        debug!(timeout_ms = item.shared.timeout_ms, "watchdog item removed");
        Ok(())
    }

    /// Invalidates and drops every item and cancels the tick.
    pub fn cleanup(&self) {
        let dropped = {
            let mut items = self.inner.items.lock();
            for it in items.iter() {
                it.valid.store(false, Ordering::Release);
            }
            self.inner.work_active.store(false, Ordering::Release);
            self.inner.period_ms.store(0, Ordering::Release);
            std::mem::take(&mut *items).len()
        };
        self.inner.ticker.cancel_sync();
        if dropped > 0 {
            info!(dropped, "watchdog cleaned up");
        }
    }

    /// Current tick interval in milliseconds; zero while idle.
    pub fn period_ms(&self) -> u64 {
        self.inner.period_ms.load(Ordering::Acquire)
    }

    /// True while a tick is scheduled.
    pub fn work_active(&self) -> bool {
        self.inner.work_active.load(Ordering::Acquire)
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cleanup();
        self.inner.ticker.shutdown();
    }
}

impl Inner {
    /// Re-derives the tick period from the shortest valid timeout. Called
    /// with the registry lock held.
    fn recompute_period(&self, items: &[Arc<ItemShared>]) {
        let min_timeout = items
            .iter()
            .filter(|it| it.valid.load(Ordering::Acquire))
            .map(|it| it.timeout_ms)
            .min();
        match min_timeout {
            None => {
                self.work_active.store(false, Ordering::Release);
                self.period_ms.store(0, Ordering::Release);
                // Non-blocking: a synchronous cancel here would deadlock
                // against a tick waiting for the registry lock.
                self.ticker.cancel();
                debug!("watchdog idle");
            }
            Some(min_timeout) => {
                let period = (min_timeout / 2).max(MAX_WORK_PERIOD_MS);
                let previous = self.period_ms.swap(period, Ordering::AcqRel);
                let was_active = self.work_active.swap(true, Ordering::AcqRel);
                if !was_active || previous != period {
                    debug!(period_ms = period, "watchdog period updated");
                    self.ticker.schedule(period);
                }
            }
        }
    }

    /// One tick. Fires recovery for every armed item whose elapsed time
    /// has reached its timeout; items stay armed so recovery repeats on
    /// the next tick.
    fn tick(&self) -> Option<u64> {
        if !self.work_active.load(Ordering::Acquire) {
            return None;
        }
        let now = self.clock.now_ms();
        let snapshot: Vec<Arc<ItemShared>> = self.items.lock().clone();

        for it in snapshot {
            if !it.valid.load(Ordering::Acquire) || !it.active.load(Ordering::Acquire) {
                continue;
            }
            let elapsed = now.wrapping_sub(it.start_time_ms.load(Ordering::Relaxed));
            if elapsed < it.timeout_ms {
                continue;
            }
            warn!(
                timeout_ms = it.timeout_ms,
                elapsed_ms = elapsed,
                "watchdog timeout, running recovery"
            );
            if catch_unwind(AssertUnwindSafe(|| (it.recovery)())).is_err() {
                error!(timeout_ms = it.timeout_ms, "recovery panicked");
            }
        }

        self.work_active
            .load(Ordering::Acquire)
            .then(|| self.period_ms.load(Ordering::Acquire))
            .filter(|period| *period > 0)
    }
}
