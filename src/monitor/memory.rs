//! Allocation tracking with per-block call-stack capture.

use crate::types::{Counter, MemoryUsage};
use crate::utils::fmt::format_size;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{guard_active, lock_unpoisoned, ReentrancyGuard};

struct Allocation {
    size: u64,
    stack: String,
}

/// Process-wide memory tracker.
///
/// Fed by the pluggable allocation hook ([`super::hook::TrackingAlloc`]) or
/// directly through [`record_alloc`](Self::record_alloc) /
/// [`record_dealloc`](Self::record_dealloc). Counters are monotonically
/// non-decreasing while tracking is enabled; only the high-water mark is
/// resettable.
pub struct MemoryTracker {
    enabled: AtomicBool,
    allocate_size: AtomicU64,
    allocate_count: AtomicU64,
    free_size: AtomicU64,
    free_count: AtomicU64,
    live_size: AtomicU64,
    live_count: AtomicU64,
    max_size: AtomicU64,
    max_count: AtomicU64,
    blocks: Mutex<HashMap<usize, Allocation>>,
}

impl MemoryTracker {
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            allocate_size: AtomicU64::new(0),
            allocate_count: AtomicU64::new(0),
            free_size: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            live_size: AtomicU64::new(0),
            live_count: AtomicU64::new(0),
            max_size: AtomicU64::new(0),
            max_count: AtomicU64::new(0),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn active(&self) -> bool {
        self.is_enabled() && !guard_active()
    }

    /// Record an acquisition. The capture stack of every live block is kept
    /// so a leak report can name allocation sites.
    pub fn record_alloc(&self, ptr: usize, size: u64) {
        if !self.active() {
            return;
        }
        let _guard = ReentrancyGuard::enter();

        self.allocate_size.fetch_add(size, Ordering::SeqCst);
        self.allocate_count.fetch_add(1, Ordering::SeqCst);

        let live = self.live_size.fetch_add(size, Ordering::SeqCst) + size;
        self.max_size.fetch_max(live, Ordering::SeqCst);
        let live_count = self.live_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_count.fetch_max(live_count, Ordering::SeqCst);

        let stack = Backtrace::force_capture().to_string();
        lock_unpoisoned(&self.blocks).insert(ptr, Allocation { size, stack });
    }

    /// Record a release. Pointers acquired outside the tracked region are
    /// not in the block table and are ignored.
    pub fn record_dealloc(&self, ptr: usize) {
        if !self.active() {
            return;
        }
        let _guard = ReentrancyGuard::enter();

        let removed = lock_unpoisoned(&self.blocks).remove(&ptr);
        if let Some(block) = removed {
            self.free_size.fetch_add(block.size, Ordering::SeqCst);
            self.free_count.fetch_add(1, Ordering::SeqCst);
            self.live_size.fetch_sub(block.size, Ordering::SeqCst);
            self.live_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Current counter values.
    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            allocate: Counter {
                size: self.allocate_size.load(Ordering::SeqCst),
                count: self.allocate_count.load(Ordering::SeqCst),
            },
            deallocate: Counter {
                size: self.free_size.load(Ordering::SeqCst),
                count: self.free_count.load(Ordering::SeqCst),
            },
            max: Counter {
                size: self.max_size.load(Ordering::SeqCst),
                count: self.max_count.load(Ordering::SeqCst),
            },
        }
    }

    /// Reset the high-water mark only; flow counters keep accumulating.
    pub fn reset_high_water(&self) {
        self.max_size.store(0, Ordering::SeqCst);
        self.max_count.store(0, Ordering::SeqCst);
    }

    /// Drop all block bookkeeping. Called on the sandbox child's exit path,
    /// where the process is ending regardless of what is still live.
    pub fn clear(&self) {
        lock_unpoisoned(&self.blocks).clear();
    }

    /// Human-readable report naming the allocation site of every block
    /// still tracked as live. Empty string when nothing is outstanding.
    pub fn leak_report(&self) -> String {
        let _guard = ReentrancyGuard::enter();
        let blocks = lock_unpoisoned(&self.blocks);
        if blocks.is_empty() {
            return String::new();
        }

        let mut entries: Vec<(&usize, &Allocation)> = blocks.iter().collect();
        entries.sort_by_key(|(ptr, _)| **ptr);

        let mut report = String::from("\nOutstanding allocations:\n");
        for (ptr, block) in entries {
            report.push_str(&format!(
                "  block {:#x} ({}) allocated at:\n{}\n",
                ptr,
                format_size(block.size),
                block.stack
            ));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::super::{force_disable, test_guard};
    use super::*;

    #[test]
    fn balanced_alloc_free_nets_to_zero() {
        let _serial = test_guard();
        force_disable();
        super::super::enter();

        let before = super::super::memory().usage();
        for i in 0..4usize {
            super::super::memory().record_alloc(0x1000 + i, 256);
        }
        for i in 0..4usize {
            super::super::memory().record_dealloc(0x1000 + i);
        }
        let after = super::super::memory().usage();

        super::super::exit();

        assert_eq!(after.allocate.size - before.allocate.size, 1024);
        assert_eq!(after.allocate.count - before.allocate.count, 4);
        assert_eq!(
            after.allocate.size - before.allocate.size,
            after.deallocate.size - before.deallocate.size
        );
        assert_eq!(
            after.allocate.count - before.allocate.count,
            after.deallocate.count - before.deallocate.count
        );
    }

    #[test]
    fn high_water_tracks_peak_live_blocks() {
        let _serial = test_guard();
        force_disable();
        super::super::memory().clear();
        super::super::memory().reset_high_water();
        super::super::enter();

        let tracker = super::super::memory();
        // Three live at once, then all freed.
        tracker.record_alloc(0x2000, 100);
        tracker.record_alloc(0x2001, 100);
        tracker.record_alloc(0x2002, 100);
        tracker.record_dealloc(0x2000);
        tracker.record_dealloc(0x2001);
        tracker.record_dealloc(0x2002);

        let usage = tracker.usage();
        super::super::exit();

        assert!(usage.max.count >= 3);
        assert!(usage.max.size >= 300);
    }

    #[test]
    fn leak_report_names_outstanding_blocks() {
        let _serial = test_guard();
        force_disable();
        super::super::memory().clear();
        super::super::enter();

        super::super::memory().record_alloc(0x3000, 512);
        let report = super::super::memory().leak_report();

        super::super::memory().clear();
        super::super::exit();

        assert!(report.contains("0x3000"));
        assert!(report.contains("allocated at:"));
    }

    #[test]
    fn untracked_pointer_free_is_ignored() {
        let _serial = test_guard();
        force_disable();
        super::super::enter();

        let before = super::super::memory().usage();
        super::super::memory().record_dealloc(0xdead_0000);
        let after = super::super::memory().usage();

        super::super::exit();

        assert_eq!(before.deallocate, after.deallocate);
    }

    #[test]
    fn disabled_tracker_records_nothing() {
        let _serial = test_guard();
        force_disable();

        let before = super::super::memory().usage();
        super::super::memory().record_alloc(0x4000, 64);
        let after = super::super::memory().usage();

        assert_eq!(before.allocate, after.allocate);
    }
}
