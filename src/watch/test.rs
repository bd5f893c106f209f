use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::filter::Hysteresis;
use super::{Item, Opts, StartOutcome, StopOutcome, Watcher};
use crate::error::Error;
use crate::time::ManualClock;

type ActionLog = Arc<Mutex<Vec<(i64, i64)>>>;

fn recorder() -> (ActionLog, super::ActionFn) {
    let log: ActionLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let action: super::ActionFn = Arc::new(move |old, new| sink.lock().push((old, new)));
    (log, action)
}

fn scripted(values: &'static [i64]) -> impl Fn() -> i64 + Send + Sync {
    let idx = AtomicUsize::new(0);
    move || {
        let i = idx.fetch_add(1, Ordering::SeqCst);
        values[i.min(values.len() - 1)]
    }
}

#[test]
fn test_filter_disabled_compares_raw() {
    let mut f = Hysteresis::new(0);
    assert!(!f.observe(5, 5));
    assert!(f.observe(5, 8));
    assert!(f.observe(5, 8));
}

#[test]
fn test_filter_threshold_one_fires_on_first_divergence() {
    let mut f = Hysteresis::new(1);
    assert!(!f.observe(5, 5));
    assert!(f.observe(5, 8));
}

#[test]
fn test_filter_counts_consecutive_samples() {
    let mut f = Hysteresis::new(3);
    assert!(!f.observe(0, 7));
    assert!(!f.observe(0, 7));
    assert!(f.observe(0, 7));
    // The streak resets after firing.
    assert!(!f.observe(7, 9));
}

#[test]
fn test_filter_baseline_return_resets_streak() {
    let mut f = Hysteresis::new(2);
    assert!(!f.observe(0, 4));
    assert!(!f.observe(0, 0));
    assert!(!f.observe(0, 4));
    assert!(f.observe(0, 4));
}

#[test]
fn test_filter_new_candidate_resets_streak() {
    let mut f = Hysteresis::new(3);
    assert!(!f.observe(0, 4));
    assert!(!f.observe(0, 4));
    assert!(!f.observe(0, 6));
    assert!(!f.observe(0, 6));
    assert!(f.observe(0, 6));
}

#[test]
fn test_zero_base_period_resolves_to_default() {
    let watcher = Watcher::new(0);
    assert_eq!(watcher.base_period_ms(), super::DEFAULT_BASE_PERIOD_MS);
}

#[test]
fn test_period_validation() {
    let watcher = Watcher::new(100);
    let below = watcher.add_item(
        Opts {
            period_ms: 50,
            ..Opts::default()
        },
        || 0,
        None,
    );
    assert!(matches!(below, Err(Error::InvalidArgument(_))));

    let non_multiple = watcher.add_item(
        Opts {
            period_ms: 150,
            ..Opts::default()
        },
        || 0,
        None,
    );
    assert!(matches!(non_multiple, Err(Error::InvalidArgument(_))));

    // Failed adds leave no trace.
    assert_eq!(watcher.stats().active_items, 0);

    watcher
        .add_item(
            Opts {
                period_ms: 300,
                ..Opts::default()
            },
            || 0,
            None,
        )
        .unwrap();
    let zero = watcher.add_item(Opts::default(), || 0, None).unwrap();
    assert_eq!(watcher.items()[1].period_ms, 100);
    drop(zero);
}

#[test]
fn test_name_truncation_and_auto_names() {
    let watcher = Watcher::new(100);
    let long = "a-rather-long-interface-state-item-name-indeed";
    let named = watcher
        .add_item(
            Opts {
                name: Some(long.into()),
                ..Opts::default()
            },
            || 0,
            None,
        )
        .unwrap();
    assert_eq!(named.name().unwrap(), &long[..super::ITEM_NAME_MAX]);

    let anon = watcher.add_item(Opts::default(), || 0, None).unwrap();
    assert!(anon.name().unwrap().starts_with("item-"));
}

#[test]
fn test_start_stop_outcomes() {
    let watcher = Watcher::new(50);
    assert_eq!(watcher.stop(), StopOutcome::AlreadyStopped);
    assert_eq!(watcher.start(), StartOutcome::Started);
    assert_eq!(watcher.start(), StartOutcome::AlreadyRunning);
    assert!(watcher.is_running());
    assert_eq!(watcher.stop(), StopOutcome::Stopped);
    assert_eq!(watcher.stop(), StopOutcome::AlreadyStopped);
    assert!(!watcher.is_running());
}

#[test]
fn test_hysteresis_staircase() {
    let clock = ManualClock::at(1_000);
    let watcher = Watcher::with_clock(100, clock.clone());
    let (log, action) = recorder();
    let item = watcher
        .add_item(
            Opts {
                hysteresis: 3,
                ..Opts::default()
            },
            scripted(&[5, 5, 5, 5, 5, 8, 8, 5, 8, 8, 8, 8]),
            Some(action),
        )
        .unwrap();

    watcher.inner.running.store(true, Ordering::Release);
    for _ in 0..12 {
        clock.advance(100);
        watcher.inner.tick();
    }

    assert_eq!(*log.lock(), vec![(0, 5), (5, 8)]);
    assert_eq!(item.stats().unwrap().sample_count, 12);
    assert_eq!(item.stats().unwrap().action_count, 2);
    assert_eq!(item.state().unwrap(), 8);
}

#[test]
fn test_forced_override_bypass_and_expiry() {
    let clock = ManualClock::at(0);
    let watcher = Watcher::with_clock(100, clock.clone());
    let (log, action) = recorder();
    let item = watcher
        .add_item(
            Opts {
                hysteresis: 3,
                ..Opts::default()
            },
            || 5,
            Some(action),
        )
        .unwrap();

    watcher.inner.running.store(true, Ordering::Release);
    let tick = || {
        clock.advance(100);
        watcher.inner.tick();
    };

    // Settle on baseline 5 through the filter, then two stable samples.
    for _ in 0..5 {
        tick();
    }
    assert_eq!(*log.lock(), vec![(0, 5)]);

    // t=500: override to 9 for one second.
    item.force_state(9, 1_000).unwrap();
    tick();
    // The override bypasses hysteresis and fires on the next due sample.
    assert_eq!(*log.lock(), vec![(0, 5), (5, 9)]);
    assert_eq!(item.state().unwrap(), 9);
    assert_eq!(item.forced_remaining_ms().unwrap(), Some(900));

    // Forced and stable at 9 until the deadline: no further actions, but
    // the sampler keeps running and keeps being counted.
    let before = item.stats().unwrap().sample_count;
    for _ in 0..9 {
        tick();
    }
    assert_eq!(item.stats().unwrap().sample_count, before + 9);
    assert_eq!(log.lock().len(), 2);

    // Past the deadline the override self-clears and raw samples resume
    // through the normal comparator: three consecutive 5s fire.
    tick();
    assert_eq!(item.forced_remaining_ms().unwrap(), None);
    tick();
    tick();
    assert_eq!(*log.lock(), vec![(0, 5), (5, 9), (9, 5)]);
}

#[test]
fn test_force_state_validation_and_rearm() {
    let clock = ManualClock::at(0);
    let watcher = Watcher::with_clock(100, clock.clone());
    let item = watcher.add_item(Opts::default(), || 0, None).unwrap();

    assert_eq!(
        item.force_state(1, 0),
        Err(Error::InvalidArgument("override duration must be positive"))
    );
    assert_eq!(item.forced_remaining_ms().unwrap(), None);

    item.force_state(1, 500).unwrap();
    assert_eq!(item.forced_remaining_ms().unwrap(), Some(500));

    // Re-arming replaces both value and deadline.
    item.force_state(2, 2_000).unwrap();
    assert_eq!(item.forced_remaining_ms().unwrap(), Some(2_000));

    item.clear_forced_state().unwrap();
    assert_eq!(item.forced_remaining_ms().unwrap(), None);

    // Auto-expiry is eager on query.
    item.force_state(3, 100).unwrap();
    clock.advance(150);
    assert_eq!(item.forced_remaining_ms().unwrap(), None);
}

#[test]
fn test_remove_item_during_own_action() {
    let clock = ManualClock::at(0);
    let watcher = Watcher::with_clock(100, clock.clone());

    let slot: Arc<Mutex<Option<Item>>> = Arc::new(Mutex::new(None));
    let inner_slot = Arc::clone(&slot);
    let action: super::ActionFn = Arc::new(move |_, _| {
        if let Some(item) = inner_slot.lock().take() {
            item.remove().unwrap();
        }
    });

    let state = Arc::new(AtomicI64::new(1));
    let source = Arc::clone(&state);
    let item = watcher
        .add_item(
            Opts::default(),
            move || source.load(Ordering::SeqCst),
            Some(action),
        )
        .unwrap();
    *slot.lock() = Some(item.clone());

    watcher.inner.running.store(true, Ordering::Release);
    clock.advance(100);
    watcher.inner.tick();

    assert_eq!(watcher.stats().active_items, 0);
    assert_eq!(watcher.stats().total_actions, 1);
    assert_eq!(
        item.state(),
        Err(Error::InvalidArgument("stale watch item handle"))
    );

    // Later ticks no longer touch the removed item.
    clock.advance(100);
    watcher.inner.tick();
    assert_eq!(watcher.stats().total_samples, 1);
}

#[test]
fn test_stale_handle_after_remove() {
    let watcher = Watcher::new(100);
    let item = watcher.add_item(Opts::default(), || 0, None).unwrap();
    watcher.remove_item(&item).unwrap();
    assert!(matches!(item.stats(), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        watcher.remove_item(&item),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_handle_outliving_watcher() {
    let watcher = Watcher::new(100);
    let item = watcher.add_item(Opts::default(), || 0, None).unwrap();
    drop(watcher);
    assert_eq!(item.state(), Err(Error::NotInitialized));
}

#[test]
fn test_cleanup_drops_items_and_watcher_stays_usable() {
    let watcher = Watcher::new(100);
    watcher.add_item(Opts::default(), || 0, None).unwrap();
    watcher.add_item(Opts::default(), || 0, None).unwrap();
    watcher.start();
    watcher.cleanup();
    assert!(!watcher.is_running());
    assert_eq!(watcher.stats().active_items, 0);

    watcher.add_item(Opts::default(), || 0, None).unwrap();
    assert_eq!(watcher.stats().active_items, 1);
}

#[test]
fn test_stop_drains_no_callback_after_return() {
    let samples = Arc::new(AtomicUsize::new(0));
    let source = Arc::clone(&samples);
    let watcher = Watcher::new(20);
    watcher
        .add_item(
            Opts::default(),
            move || {
                source.fetch_add(1, Ordering::SeqCst);
                0
            },
            None,
        )
        .unwrap();

    watcher.start();
    std::thread::sleep(Duration::from_millis(150));
    watcher.stop();

    let snapshot = samples.load(Ordering::SeqCst);
    assert!(snapshot > 0);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(samples.load(Ordering::SeqCst), snapshot);
}

#[test]
fn test_interval_respected_for_slow_items() {
    let clock = ManualClock::at(0);
    let watcher = Watcher::with_clock(100, clock.clone());
    let fast = watcher.add_item(Opts::default(), || 0, None).unwrap();
    let slow = watcher
        .add_item(
            Opts {
                period_ms: 300,
                ..Opts::default()
            },
            || 0,
            None,
        )
        .unwrap();

    watcher.inner.running.store(true, Ordering::Release);
    for _ in 0..6 {
        clock.advance(100);
        watcher.inner.tick();
    }
    assert_eq!(fast.stats().unwrap().sample_count, 6);
    assert_eq!(slow.stats().unwrap().sample_count, 2);
}

#[test]
fn test_sampler_panic_is_contained() {
    let clock = ManualClock::at(0);
    let watcher = Watcher::with_clock(100, clock.clone());
    let bad = watcher
        .add_item(Opts::default(), || panic!("sampler failure"), None)
        .unwrap();
    let good = watcher.add_item(Opts::default(), || 7, None).unwrap();

    watcher.inner.running.store(true, Ordering::Release);
    clock.advance(100);
    watcher.inner.tick();

    // The panicking sampler is charged for the dispatch and the engine
    // moves on to the next item.
    assert_eq!(bad.stats().unwrap().sample_count, 1);
    assert_eq!(good.state().unwrap(), 7);
}
