use std::time::Duration;

use super::{Clock, ManualClock, MonotonicClock};

#[test]
fn test_monotonic_never_decreases() {
    let clock = MonotonicClock;
    let a = clock.now_ms();
    std::thread::sleep(Duration::from_millis(5));
    let b = clock.now_ms();
    assert!(b >= a);
}

#[test]
fn test_manual_clock_advances() {
    let clock = ManualClock::at(1000);
    assert_eq!(clock.now_ms(), 1000);
    clock.advance(250);
    assert_eq!(clock.now_ms(), 1250);
}
