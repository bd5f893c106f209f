//! Single-instance delayed task used by every engine.
//!
//! A [`Ticker`] owns at most one worker thread and at most one armed
//! deadline. The task body runs when the deadline passes and returns the
//! delay to the next run, or `None` to go idle. Nothing is spawned until
//! the first [`schedule`][Ticker::schedule], so an idle ticker costs
//! nothing.


use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::time::{ms_duration, Clock};

/// Tick body: runs once per fire, returns the next delay in milliseconds
/// or `None` to stop rescheduling.
pub(crate) type TickBody = Box<dyn FnMut() -> Option<u64> + Send>;

pub(crate) struct Ticker {
    shared: Arc<Shared>,
    name: &'static str,
}

struct Shared {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    /// Wakes the worker on schedule, cancel and shutdown.
    tick_cv: Condvar,
    /// Signals completion of an in-flight body to `cancel_sync` waiters.
    done_cv: Condvar,
}

struct State {
    deadline_ms: Option<u64>,
    /// The body is executing right now (outside the lock).
    running: bool,
    /// Bumped by cancel/shutdown; an in-flight body whose generation is
    /// stale must not reschedule itself.
    cancel_gen: u64,
    shutdown: bool,
    /// Body parked here until the worker thread takes it on first spawn.
    body: Option<TickBody>,
    worker: Option<ThreadId>,
    joiner: Option<JoinHandle<()>>,
}

impl Ticker {
    pub(crate) fn new(name: &'static str, clock: Arc<dyn Clock>, body: TickBody) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                state: Mutex::new(State {
                    deadline_ms: None,
                    running: false,
                    cancel_gen: 0,
                    shutdown: false,
                    body: Some(body),
                    worker: None,
                    joiner: None,
                }),
                tick_cv: Condvar::new(),
                done_cv: Condvar::new(),
            }),
            name,
        }
    }

    /// Arms the deadline `delay_ms` from now, replacing any armed deadline.
    /// Spawns the worker thread on first use.
    pub(crate) fn schedule(&self, delay_ms: u64) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.deadline_ms = Some(self.shared.clock.now_ms().saturating_add(delay_ms));
        if state.worker.is_none() {
            let shared = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name(format!("netwatch-{}", self.name))
                .spawn(move || worker_loop(&shared))
            {
                Ok(handle) => {
                    state.worker = Some(handle.thread().id());
                    state.joiner = Some(handle);
                }
                Err(e) => {
                    // The body stays parked in the state; the next
                    // schedule retries the spawn.
                    error!(ticker = self.name, error = %e, "failed to spawn worker thread");
                    state.deadline_ms = None;
                    return;
                }
            }
        }
        self.shared.tick_cv.notify_all();
    }

    /// Disarms without waiting. An in-flight body finishes but will not
    /// reschedule itself.
    pub(crate) fn cancel(&self) {
        let mut state = self.shared.state.lock();
        state.cancel_gen = state.cancel_gen.wrapping_add(1);
        state.deadline_ms = None;
    }

    /// Disarms and blocks until any in-flight body completes. No later
    /// instance starts once this returns.
    ///
    /// Recognizes its own worker thread (an engine API called from inside a
    /// user callback) and skips the wait there; the surrounding tick
    /// observes the bumped generation and stops.
    pub(crate) fn cancel_sync(&self) {
        let mut state = self.shared.state.lock();
        state.cancel_gen = state.cancel_gen.wrapping_add(1);
        state.deadline_ms = None;
        if state.worker == Some(thread::current().id()) {
            return;
        }
        while state.running {
            self.shared.done_cv.wait(&mut state);
        }
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        let state = self.shared.state.lock();
        state.deadline_ms.is_some() || state.running
    }

    /// Stops the worker thread and joins it, unless called on the worker
    /// itself (then the thread is detached and exits on its own).
    pub(crate) fn shutdown(&self) {
        let (joiner, on_worker) = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.cancel_gen = state.cancel_gen.wrapping_add(1);
            state.deadline_ms = None;
            self.shared.tick_cv.notify_all();
            (
                state.joiner.take(),
                state.worker == Some(thread::current().id()),
            )
        };
        if let Some(handle) = joiner {
            if on_worker {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    let Some(mut body) = state.body.take() else {
        return;
    };
    loop {
        if state.shutdown {
            break;
        }
        let Some(deadline) = state.deadline_ms else {
            shared.tick_cv.wait(&mut state);
            continue;
        };
        let now = shared.clock.now_ms();
        if now < deadline {
            let _ = shared
                .tick_cv
                .wait_for(&mut state, ms_duration(deadline - now));
            continue;
        }

        state.deadline_ms = None;
        state.running = true;
        let generation = state.cancel_gen;
        drop(state);

        let next = body();

        state = shared.state.lock();
        state.running = false;
        // A schedule() issued while the body ran takes precedence over the
        // body's own reschedule.
        if state.cancel_gen == generation && !state.shutdown && state.deadline_ms.is_none() {
            if let Some(delay) = next {
                state.deadline_ms = Some(shared.clock.now_ms().saturating_add(delay));
            }
        }
        shared.done_cv.notify_all();
    }
}
