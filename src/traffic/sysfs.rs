//! `/sys/class/net` counter adaptor.
//!
//! Resolves interface names against the kernel's per-interface statistics
//! directory. Only names handed to [`lookup`][SysfsProvider::lookup] are
//! ever touched; there is no enumeration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{CounterSet, DeviceProvider, DeviceStats};

/// Device provider backed by `/sys/class/net/<name>/statistics`.
pub struct SysfsProvider {
    root: PathBuf,
}

impl SysfsProvider {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/sys/class/net"),
        }
    }

    /// Points the provider at an alternate sysfs root (containers, tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProvider for SysfsProvider {
    fn lookup(&self, name: &str) -> Option<Arc<dyn DeviceStats>> {
        if name.is_empty() || name.contains(['/', '\0']) {
            return None;
        }
        let dir = self.root.join(name).join("statistics");
        dir.is_dir()
            .then(|| Arc::new(SysfsDevice { dir }) as Arc<dyn DeviceStats>)
    }
}

struct SysfsDevice {
    dir: PathBuf,
}

fn read_counter(dir: &Path, file: &str) -> Option<u64> {
    let text = fs::read_to_string(dir.join(file)).ok()?;
    text.trim().parse().ok()
}

impl DeviceStats for SysfsDevice {
    fn read_stats(&self) -> Option<CounterSet> {
        Some(CounterSet {
            tx_packets: read_counter(&self.dir, "tx_packets")?,
            tx_bytes: read_counter(&self.dir, "tx_bytes")?,
            rx_packets: read_counter(&self.dir, "rx_packets")?,
            rx_bytes: read_counter(&self.dir, "rx_bytes")?,
        })
    }
}
