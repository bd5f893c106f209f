//! Periodic observation engines for interface monitoring: a state watcher
//! with hysteresis filtering, an adaptive timeout supervisor and a
//! per-interface traffic rate sampler.
//!
//! ## Example
//!
//! Watch a signal level and react once a change persists for two
//! consecutive samples:
//!
//! ```rust
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use std::sync::Arc;
//!
//! use netwatch::watch::{Opts, Watcher};
//!
//! let level = Arc::new(AtomicI64::new(0));
//!
//! let watcher = Watcher::new(50); // 50 ms scheduling granularity
//! let source = Arc::clone(&level);
//! let item = watcher
//!     .add_item(
//!         Opts { name: Some("signal".into()), hysteresis: 2, ..Opts::default() },
//!         move || source.load(Ordering::Relaxed),
//!         Some(Arc::new(|old, new| println!("signal level {old} -> {new}"))),
//!     )
//!     .unwrap();
//!
//! watcher.start();
//! level.store(3, Ordering::Relaxed); // two consecutive 3s fire the action
//! std::thread::sleep(std::time::Duration::from_millis(300));
//! watcher.stop();
//!
//! assert!(item.stats().unwrap().sample_count >= 2);
//! ```
//!
//! ## Engines
//!
//! The three engines are independent and may be composed in any order:
//!
//! - [`watch`] samples integer states on per-item intervals and dispatches
//!   actions through a hysteresis filter, with time-bounded state override.
//! - [`watchdog`] supervises timeouts with a tick that adapts to the
//!   shortest registered timeout and costs nothing while idle.
//! - [`traffic`] snapshots interface counters on a fixed tick and answers
//!   wrap-safe per-second rate queries.
//!
//! Samplers, actions and recovery callbacks always run with engine locks
//! released, so they may block and may call back into the engine. A
//! blocking callback stalls its own engine's tick; there is no per-callback
//! timeout.

pub mod error;
mod sched;
pub mod time;
pub mod traffic;
pub mod watch;
pub mod watchdog;

pub use error::{Error, Result};
