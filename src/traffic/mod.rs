//! Per-interface traffic rate sampler.
//!
//! A [`Traffic`] registry tracks a configured set of interface names. When
//! the host reports one of them up (via [`Traffic::handle_device_event`]),
//! the sampler resolves it through its [`DeviceProvider`], takes paired
//! counter snapshots on a fixed periodic tick and answers per-second rate
//! queries from the snapshot pair. Counter and timestamp deltas are wrap
//! aware; see [`rate`].

pub mod rate;
#[cfg(target_os = "linux")]
pub mod sysfs;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arrayvec::ArrayString;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sched::Ticker;
use crate::time::{default_clock, Clock};

/// Snapshot interval of the periodic tick.
pub const TRAFFIC_SAMPLE_PERIOD_MS: u64 = 100;

/// Longest accepted interface name; longer names are truncated.
pub const IFNAME_MAX: usize = 15;

#[cfg(target_os = "linux")]
const _: () = assert!(IFNAME_MAX + 1 == libc::IF_NAMESIZE);

type IfName = ArrayString<IFNAME_MAX>;

/// One reading of an interface's packet and byte counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterSet {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Per-second rates derived from a snapshot pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl RateSnapshot {
    fn saturating_add(self, other: Self) -> Self {
        Self {
            tx_packets: self.tx_packets.saturating_add(other.tx_packets),
            tx_bytes: self.tx_bytes.saturating_add(other.tx_bytes),
            rx_packets: self.rx_packets.saturating_add(other.rx_packets),
            rx_bytes: self.rx_bytes.saturating_add(other.rx_bytes),
        }
    }
}

/// Counter source for one device.
pub trait DeviceStats: Send + Sync {
    /// Primary counter read; `None` when the device does not implement it.
    fn read_stats(&self) -> Option<CounterSet>;

    /// Fallback used when the primary read is absent.
    fn read_stats_fallback(&self) -> CounterSet {
        CounterSet::default()
    }
}

/// Resolves configured interface names to their counter sources.
pub trait DeviceProvider: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn DeviceStats>>;
}

/// Device notifications routed in by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The interface came up; a targeted name gets registered.
    Up,
    /// The interface is about to go down.
    GoingDown,
    /// The interface is being torn down; backup cleanup.
    Unregister,
}

struct Entry {
    device: Arc<dyn DeviceStats>,
    current: CounterSet,
    previous: CounterSet,
    current_ts_ms: u64,
    previous_ts_ms: u64,
}

impl Entry {
    fn rates(&self) -> RateSnapshot {
        let dt_ms = rate::wrapping_delta(self.current_ts_ms, self.previous_ts_ms);
        let field = |c, p| rate::per_second(rate::wrapping_delta(c, p), dt_ms);
        RateSnapshot {
            tx_packets: field(self.current.tx_packets, self.previous.tx_packets),
            tx_bytes: field(self.current.tx_bytes, self.previous.tx_bytes),
            rx_packets: field(self.current.rx_packets, self.previous.rx_packets),
            rx_bytes: field(self.current.rx_bytes, self.previous.rx_bytes),
        }
    }

    fn refresh(&mut self, now_ms: u64) {
        self.previous = self.current;
        self.previous_ts_ms = self.current_ts_ms;
        self.current = read_device(&*self.device);
        self.current_ts_ms = now_ms;
    }
}

fn read_device(device: &dyn DeviceStats) -> CounterSet {
    device
        .read_stats()
        .unwrap_or_else(|| device.read_stats_fallback())
}

struct Inner {
    clock: Arc<dyn Clock>,
    provider: Arc<dyn DeviceProvider>,
    targets: Vec<IfName>,
    entries: RwLock<HashMap<IfName, Entry>>,
    /// Shutdown barrier: event handlers observing this drop their work.
    stopping: AtomicBool,
    ticker: Ticker,
}

/// Traffic rate sampler. See the [module docs][self].
pub struct Traffic {
    inner: Arc<Inner>,
}

impl Traffic {
    /// Creates a sampler for the given target interface names. Nothing is
    /// sampled until the host reports a targeted interface up.
    pub fn new<I, S>(provider: Arc<dyn DeviceProvider>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_clock(provider, targets, default_clock())
    }

    /// Same as [`new`][Self::new] with a caller-supplied clock.
    pub fn with_clock<I, S>(
        provider: Arc<dyn DeviceProvider>,
        targets: I,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: Vec<IfName> = targets.into_iter().map(|s| ifname(s.as_ref())).collect();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let body = Box::new(move || weak.upgrade().and_then(|inner| inner.tick()));
            Inner {
                clock: Arc::clone(&clock),
                provider,
                targets,
                entries: RwLock::new(HashMap::new()),
                stopping: AtomicBool::new(false),
                ticker: Ticker::new("traffic", clock, body),
            }
        });
        Self { inner }
    }

    /// Routes a device notification into the sampler. Ignored for names
    /// outside the configured target set and after [`cleanup`][Self::cleanup].
    pub fn handle_device_event(&self, event: DeviceEvent, name: &str) {
        if self.inner.stopping.load(Ordering::Acquire) {
            return;
        }
        match event {
            DeviceEvent::Up => {
                if !self.inner.is_target(name) {
                    debug!(interface = name, "device up for untargeted interface");
                    return;
                }
                match self.inner.register(name) {
                    Ok(()) => {
                        if !self.inner.ticker.is_scheduled() {
                            self.inner.ticker.schedule(TRAFFIC_SAMPLE_PERIOD_MS);
                        }
                    }
                    Err(Error::Exists) => {}
                    Err(e) => warn!(interface = name, error = %e, "failed to register interface"),
                }
            }
            DeviceEvent::GoingDown | DeviceEvent::Unregister => {
                self.inner.unregister(name);
            }
        }
    }

    /// Per-second rates for one interface. Unknown names answer a zero
    /// snapshot (logged, not an error).
    pub fn delta_single(&self, name: &str) -> RateSnapshot {
        let key = ifname(name);
        let entries = self.inner.entries.read();
        match entries.get(&key) {
            Some(entry) => entry.rates(),
            None => {
                warn!(interface = name, "rate query for unregistered interface");
                RateSnapshot::default()
            }
        }
    }

    /// Elementwise sum of per-second rates across all registered
    /// interfaces.
    pub fn delta_all(&self) -> RateSnapshot {
        self.inner
            .entries
            .read()
            .values()
            .fold(RateSnapshot::default(), |acc, entry| {
                acc.saturating_add(entry.rates())
            })
    }

    /// Number of currently registered interfaces.
    pub fn active_count(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Sets the shutdown barrier, drains the tick and drops all entries.
    pub fn cleanup(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.ticker.cancel_sync();
        let dropped = {
            let mut entries = self.inner.entries.write();
            let n = entries.len();
            entries.clear();
            n
        };
        if dropped > 0 {
            info!(dropped, "traffic sampler cleaned up");
        }
    }
}

impl Drop for Traffic {
    fn drop(&mut self) {
        self.cleanup();
        self.inner.ticker.shutdown();
    }
}

impl Inner {
    fn is_target(&self, name: &str) -> bool {
        let key = ifname(name);
        self.targets.iter().any(|t| *t == key)
    }

    /// Adds an interface known to the provider. Both snapshots are seeded
    /// with the first reading, so rates stay zero until the tick produces
    /// a real pair.
    fn register(&self, name: &str) -> Result<()> {
        let key = ifname(name);
        let device = self
            .provider
            .lookup(key.as_str())
            .ok_or(Error::NotFound)?;

        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(Error::Exists);
        }
        entries.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        let now = self.clock.now_ms();
        let first = read_device(&*device);
        entries.insert(
            key,
            Entry {
                device,
                current: first,
                previous: first,
                current_ts_ms: now,
                previous_ts_ms: now,
            },
        );
        info!(interface = name, "interface registered for sampling");
        Ok(())
    }

    /// Drops an interface. Unregistering an unknown name is a no-op; the
    /// event handler may legitimately see the same teardown twice.
    fn unregister(&self, name: &str) {
        let key = ifname(name);
        let removed = self.entries.write().remove(&key).is_some();
        if removed {
            info!(interface = name, "interface unregistered");
        } else {
            debug!(interface = name, "unregister for unknown interface");
        }
    }

    /// One snapshot pass over every entry, then reschedule while there is
    /// anything left to sample.
    fn tick(&self) -> Option<u64> {
        if self.stopping.load(Ordering::Acquire) {
            return None;
        }
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            entry.refresh(now);
        }
        let keep = !entries.is_empty();
        drop(entries);

        (keep && !self.stopping.load(Ordering::Acquire)).then_some(TRAFFIC_SAMPLE_PERIOD_MS)
    }
}

fn ifname(name: &str) -> IfName {
    let mut out = IfName::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}
