//! State watcher: a multi-item sampling engine with per-item intervals,
//! hysteresis-based change detection and time-bounded state override.
//!
//! A [`Watcher`] runs one periodic tick at its base period. Each registered
//! item carries a sampler closure producing an integer state and an
//! optional action closure fired when the filtered state changes. Samplers
//! and actions run with the registry lock released, so they may block and
//! may call back into the engine, including removing their own item.

mod filter;
#[cfg(test)]
mod test;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arrayvec::ArrayString;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::sched::Ticker;
use crate::time::{default_clock, Clock};
use filter::Hysteresis;

/// Scheduling granularity applied when a watcher is created with a zero
/// base period.
pub const DEFAULT_BASE_PERIOD_MS: u64 = 200;

/// Default consecutive-sample threshold: filtering disabled.
pub const DEFAULT_HYSTERESIS: u32 = 0;

/// Display names longer than this are truncated.
pub const ITEM_NAME_MAX: usize = 31;

/// Action callback: receives `(previous_action_state, new_state)`.
pub type ActionFn = Arc<dyn Fn(i64, i64) + Send + Sync>;

type SampleFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Per-item configuration for [`Watcher::add_item`].
#[derive(Clone, Debug, Default)]
pub struct Opts {
    /// Display name. Auto-generated (`item-<id>`) when `None`; truncated
    /// to [`ITEM_NAME_MAX`] characters.
    pub name: Option<String>,
    /// Sampling interval. Zero resolves to the watcher base period;
    /// otherwise it must be a multiple of the base period and at least it.
    pub period_ms: u64,
    /// Consecutive identical samples required before the action fires.
    /// Zero disables filtering.
    pub hysteresis: u32,
}

/// Result of [`Watcher::start`]. Duplicate starts are idempotent outcomes,
/// not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// The engine transitioned to running and the first tick is scheduled.
    Started,
    /// The engine was already running; nothing changed.
    AlreadyRunning,
}

/// Result of [`Watcher::stop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The engine stopped; any in-flight tick has drained.
    Stopped,
    /// The engine was already stopped; nothing changed.
    AlreadyStopped,
}

/// Per-item counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItemStats {
    /// Sampler invocations, including those whose output an active
    /// override discarded.
    pub sample_count: u64,
    /// Action invocations.
    pub action_count: u64,
}

/// Aggregate watcher counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WatcherStats {
    pub total_samples: u64,
    pub total_actions: u64,
    pub active_items: usize,
}

/// One row of [`Watcher::items`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItemSummary {
    pub name: String,
    pub period_ms: u64,
    pub state: i64,
    pub forced: bool,
    pub sample_count: u64,
    pub action_count: u64,
}

#[derive(Clone, Copy)]
struct Forced {
    state: i64,
    expires_at_ms: u64,
}

struct ItemState {
    id: u64,
    name: ArrayString<ITEM_NAME_MAX>,
    period_ms: u64,
    sampler: SampleFn,
    action: Option<ActionFn>,
    filter: Hysteresis,
    current_state: i64,
    last_action_state: i64,
    last_sample_time: u64,
    forced: Option<Forced>,
    sample_count: u64,
    action_count: u64,
}

struct Inner {
    base_period_ms: u64,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    items: Mutex<Vec<ItemState>>,
    next_id: AtomicU64,
    total_samples: AtomicU64,
    total_actions: AtomicU64,
    ticker: Ticker,
}

/// Multi-item sampling engine. See the [module docs][self].
pub struct Watcher {
    inner: Arc<Inner>,
}

/// Stable, cloneable handle to a watch item.
///
/// Handles outlive neither their watcher (operations return
/// [`Error::NotInitialized`] once it is gone) nor their item (operations on
/// a removed item return [`Error::InvalidArgument`]).
#[derive(Clone)]
pub struct Item {
    watcher: Weak<Inner>,
    id: u64,
}

impl Watcher {
    /// Creates a stopped watcher with no items. A zero `base_period_ms`
    /// resolves to [`DEFAULT_BASE_PERIOD_MS`].
    pub fn new(base_period_ms: u64) -> Self {
        Self::with_clock(base_period_ms, default_clock())
    }

    /// Same as [`new`][Self::new] with a caller-supplied clock.
    pub fn with_clock(base_period_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let base = if base_period_ms == 0 {
            DEFAULT_BASE_PERIOD_MS
        } else {
            base_period_ms
        };
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let body = Box::new(move || weak.upgrade().and_then(|inner| inner.tick()));
            Inner {
                base_period_ms: base,
                clock: Arc::clone(&clock),
                running: AtomicBool::new(false),
                items: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                total_samples: AtomicU64::new(0),
                total_actions: AtomicU64::new(0),
                ticker: Ticker::new("watch", clock, body),
            }
        });
        Self { inner }
    }

    /// Transitions Stopped to Running and schedules the first tick one base
    /// period from now.
    pub fn start(&self) -> StartOutcome {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return StartOutcome::AlreadyRunning;
        }
        info!(base_period_ms = self.inner.base_period_ms, "watcher started");
        self.inner.ticker.schedule(self.inner.base_period_ms);
        StartOutcome::Started
    }

    /// Transitions Running to Stopped and blocks until any in-flight tick
    /// completes. No sampler or action runs after this returns.
    pub fn stop(&self) -> StopOutcome {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return StopOutcome::AlreadyStopped;
        }
        self.inner.ticker.cancel_sync();
        info!("watcher stopped");
        StopOutcome::Stopped
    }

    /// Registers a new item. The sampler is required; the action is
    /// optional and receives `(previous_action_state, new_state)`.
    pub fn add_item<S>(&self, opts: Opts, sampler: S, action: Option<ActionFn>) -> Result<Item>
    where
        S: Fn() -> i64 + Send + Sync + 'static,
    {
        let period_ms = if opts.period_ms == 0 {
            self.inner.base_period_ms
        } else {
            opts.period_ms
        };
        if period_ms < self.inner.base_period_ms || period_ms % self.inner.base_period_ms != 0 {
            return Err(Error::InvalidArgument(
                "item period must be a positive multiple of the base period",
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = match &opts.name {
            Some(name) => truncated(name),
            None => truncated(&format!("item-{id}")),
        };

        let mut items = self.inner.items.lock();
        items.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        items.push(ItemState {
            id,
            name,
            period_ms,
            sampler: Arc::new(sampler),
            action,
            filter: Hysteresis::new(opts.hysteresis),
            current_state: 0,
            last_action_state: 0,
            last_sample_time: self.inner.clock.now_ms(),
            forced: None,
            sample_count: 0,
            action_count: 0,
        });
        drop(items);

        debug!(item = id, period_ms, hysteresis = opts.hysteresis, "watch item added");
        Ok(Item {
            watcher: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Detaches and destroys an item. Safe to call from inside the item's
    /// own action.
    pub fn remove_item(&self, item: &Item) -> Result<()> {
        self.inner.remove_id(item.id)
    }

    /// Aggregate counters and the current item count.
    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            total_samples: self.inner.total_samples.load(Ordering::Relaxed),
            total_actions: self.inner.total_actions.load(Ordering::Relaxed),
            active_items: self.inner.items.lock().len(),
        }
    }

    /// Snapshot of every registered item, in insertion order.
    pub fn items(&self) -> Vec<ItemSummary> {
        self.inner
            .items
            .lock()
            .iter()
            .map(|it| ItemSummary {
                name: it.name.to_string(),
                period_ms: it.period_ms,
                state: it.current_state,
                forced: it.forced.is_some(),
                sample_count: it.sample_count,
                action_count: it.action_count,
            })
            .collect()
    }

    /// Stops the watcher (idempotent) and drops all items.
    pub fn cleanup(&self) {
        let _ = self.stop();
        let dropped = {
            let mut items = self.inner.items.lock();
            std::mem::take(&mut *items).len()
        };
        if dropped > 0 {
            info!(dropped, "watcher cleaned up");
        }
    }

    /// True while the periodic tick is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The scheduling granularity this watcher was created with.
    pub fn base_period_ms(&self) -> u64 {
        self.inner.base_period_ms
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cleanup();
        self.inner.ticker.shutdown();
    }
}

impl Item {
    /// Last sampled (or overridden) state.
    pub fn state(&self) -> Result<i64> {
        self.with(|it| it.current_state)
    }

    /// Display name.
    pub fn name(&self) -> Result<String> {
        self.with(|it| it.name.to_string())
    }

    /// Per-item counters.
    pub fn stats(&self) -> Result<ItemStats> {
        self.with(|it| ItemStats {
            sample_count: it.sample_count,
            action_count: it.action_count,
        })
    }

    /// Overrides the sampled state with `value` until `duration_ms` from
    /// now. Re-arming replaces both the value and the deadline. While the
    /// override is active the sampler still runs (and is counted), but the
    /// change detector sees `value`, compared by raw inequality with no
    /// hysteresis delay.
    pub fn force_state(&self, value: i64, duration_ms: u64) -> Result<()> {
        if duration_ms == 0 {
            return Err(Error::InvalidArgument("override duration must be positive"));
        }
        let inner = self.upgrade()?;
        let expires_at_ms = inner.clock.now_ms().saturating_add(duration_ms);
        let mut items = inner.items.lock();
        let it = find(&mut items, self.id)?;
        it.forced = Some(Forced {
            state: value,
            expires_at_ms,
        });
        debug!(item = %it.name, value, duration_ms, "state forced");
        Ok(())
    }

    /// Deactivates the override. The hysteresis scratch is left alone; the
    /// next raw sample resumes the normal filter.
    pub fn clear_forced_state(&self) -> Result<()> {
        self.with(|it| {
            if it.forced.take().is_some() {
                debug!(item = %it.name, "forced state cleared");
            }
        })
    }

    /// Remaining override time in milliseconds, or `None` when no override
    /// is active. An expired override is cleared eagerly here.
    pub fn forced_remaining_ms(&self) -> Result<Option<u64>> {
        let inner = self.upgrade()?;
        let now = inner.clock.now_ms();
        let mut items = inner.items.lock();
        let it = find(&mut items, self.id)?;
        match it.forced {
            Some(f) if now > f.expires_at_ms => {
                it.forced = None;
                Ok(None)
            }
            Some(f) => Ok(Some(f.expires_at_ms - now)),
            None => Ok(None),
        }
    }

    /// Detaches this item from its watcher. Equivalent to
    /// [`Watcher::remove_item`].
    pub fn remove(&self) -> Result<()> {
        self.upgrade()?.remove_id(self.id)
    }

    fn upgrade(&self) -> Result<Arc<Inner>> {
        self.watcher.upgrade().ok_or(Error::NotInitialized)
    }

    fn with<R>(&self, f: impl FnOnce(&mut ItemState) -> R) -> Result<R> {
        let inner = self.upgrade()?;
        let mut items = inner.items.lock();
        let it = find(&mut items, self.id)?;
        Ok(f(it))
    }
}

fn find(items: &mut [ItemState], id: u64) -> Result<&mut ItemState> {
    items
        .iter_mut()
        .find(|it| it.id == id)
        .ok_or(Error::InvalidArgument("stale watch item handle"))
}

fn truncated(name: &str) -> ArrayString<ITEM_NAME_MAX> {
    let mut out = ArrayString::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

impl Inner {
    /// One tick. Returns the delay to the next tick, or `None` when the
    /// engine stopped.
    fn tick(&self) -> Option<u64> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        let t = self.clock.now_ms();

        let mut items = self.items.lock();
        let due: Vec<u64> = items
            .iter()
            .filter(|it| t.wrapping_sub(it.last_sample_time) >= it.period_ms)
            .map(|it| it.id)
            .collect();

        for id in due {
            let Ok(it) = find(&mut items, id) else {
                // Removed while the lock was dropped for another item.
                continue;
            };
            if let Some(f) = it.forced {
                if t > f.expires_at_ms {
                    debug!(item = %it.name, "forced state expired");
                    it.forced = None;
                }
            }
            let sampler = Arc::clone(&it.sampler);

            drop(items);
            let raw = catch_unwind(AssertUnwindSafe(|| sampler()));
            items = self.items.lock();

            let Ok(it) = find(&mut items, id) else {
                continue;
            };
            it.sample_count += 1;
            self.total_samples.fetch_add(1, Ordering::Relaxed);
            it.last_sample_time = t;

            let raw = match raw {
                Ok(raw) => raw,
                Err(_) => {
                    error!(item = %it.name, "sampler panicked; sample discarded");
                    continue;
                }
            };

            // An active override feeds its value to change detection and
            // bypasses the filter; the raw sample is discarded.
            let (new_state, fire) = match it.forced {
                Some(f) => (f.state, f.state != it.last_action_state),
                None => {
                    let fire = it.filter.observe(it.last_action_state, raw);
                    (raw, fire)
                }
            };

            if fire {
                if let Some(action) = it.action.clone() {
                    let old = it.last_action_state;
                    let name = it.name;

                    drop(items);
                    if catch_unwind(AssertUnwindSafe(|| action(old, new_state))).is_err() {
                        error!(item = %name, "action panicked");
                    }
                    if !self.running.load(Ordering::Acquire) {
                        // Stopped while dispatching: abandon the tick
                        // without rescheduling.
                        return None;
                    }
                    items = self.items.lock();

                    self.total_actions.fetch_add(1, Ordering::Relaxed);
                    let Ok(it) = find(&mut items, id) else {
                        continue;
                    };
                    it.action_count += 1;
                    it.last_action_state = new_state;
                    it.current_state = new_state;
                    continue;
                }
                // No action registered; the baseline still advances so the
                // filter keeps tracking further transitions.
                it.last_action_state = new_state;
            }
            it.current_state = new_state;
        }
        drop(items);

        self.running
            .load(Ordering::Acquire)
            .then_some(self.base_period_ms)
    }

    fn remove_id(&self, id: u64) -> Result<()> {
        let mut items = self.items.lock();
        let pos = items
            .iter()
            .position(|it| it.id == id)
            .ok_or(Error::InvalidArgument("stale watch item handle"))?;
        let it = items.remove(pos);
        drop(items);
        debug!(item = %it.name, "watch item removed");
        Ok(())
    }
}
