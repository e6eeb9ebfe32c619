//! Leak detection: flags `ByteBuf`s that get dropped by their last owner
//! while still holding references, the pooled-buffer equivalent of a
//! `Drop` impl that never ran `free`.
//!
//! Sampling matches the reference allocator's levels (disabled/simple/
//! advanced/paranoid); `Simple` is the default so production deployments
//! pay the tracking cost on only a small fraction of allocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::ByteBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakDetectionLevel {
    /// No tracking at all.
    Disabled,
    /// Samples roughly 1% of allocations.
    #[default]
    Simple,
    /// Samples roughly 10% and records an allocation-site-free hint.
    Advanced,
    /// Tracks every allocation. Diagnostic use only.
    Paranoid,
}

impl LeakDetectionLevel {
    fn sample_rate(self) -> u64 {
        match self {
            LeakDetectionLevel::Disabled => 0,
            LeakDetectionLevel::Simple => 100,
            LeakDetectionLevel::Advanced => 10,
            LeakDetectionLevel::Paranoid => 1,
        }
    }
}

struct Tracked {
    region_id: u64,
    initial_ref_count: usize,
}

/// One per arena. Tracks a sampled subset of live allocations by id and
/// reports the ones whose `ByteBuf` value was dropped without reaching a
/// zero reference count through `release`.
pub struct LeakDetector {
    level: LeakDetectionLevel,
    counter: AtomicU64,
    tracked: Mutex<Vec<Tracked>>,
    reports: Mutex<Vec<String>>,
}

impl LeakDetector {
    pub(crate) fn new(level: LeakDetectionLevel) -> Self {
        LeakDetector {
            level,
            counter: AtomicU64::new(0),
            tracked: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Called right after a `ByteBuf` is constructed. Records it if this
    /// allocation falls on the sampling boundary for the configured level.
    pub(crate) fn track(&self, buf: &ByteBuf) {
        let rate = self.level.sample_rate();
        if rate == 0 {
            return;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        if n % rate != 0 {
            return;
        }
        self.tracked.lock().unwrap().push(Tracked {
            region_id: buf.region_id(),
            initial_ref_count: buf.ref_count(),
        });
    }

    /// Called when a tracked region reaches a zero reference count through
    /// the normal `release` path, clearing it from suspicion.
    pub fn confirm_released(&self, region_id: u64) {
        self.tracked.lock().unwrap().retain(|t| t.region_id != region_id);
    }

    /// Called from `ByteBuf`'s `Drop` when a tracked region's last Rust
    /// reference is going away without the region having been released —
    /// the one real signal this detector has for a forgotten release.
    pub fn note_suspect(&self, region_id: u64, held: usize) {
        let mut tracked = self.tracked.lock().unwrap();
        if let Some(pos) = tracked.iter().position(|t| t.region_id == region_id) {
            tracked.remove(pos);
            drop(tracked);
            self.reports.lock().unwrap().push(format!(
                "LEAK: region {region_id} dropped with {held} reference(s) still outstanding and no release()"
            ));
        }
    }

    pub(crate) fn drain_reports(&self) -> Vec<String> {
        std::mem::take(&mut self.reports.lock().unwrap())
    }
}
