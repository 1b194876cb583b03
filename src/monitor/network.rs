//! Network activity tracking and probabilistic send-fault injection.

use crate::types::{Counter, NetworkUsage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{guard_active, lock_unpoisoned, ReentrancyGuard};

#[derive(Default)]
struct FaultWindow {
    injecting: bool,
    chance: f64,
    blackout: Duration,
    open_until: Option<Instant>,
}

/// Process-wide network tracker.
///
/// Fault injection models transient outages rather than independent
/// per-call coin flips: once a send attempt fails, the failure window stays
/// open for the configured blackout duration before the chance is
/// re-evaluated.
pub struct NetworkTracker {
    enabled: AtomicBool,
    send_size: AtomicU64,
    send_count: AtomicU64,
    recv_size: AtomicU64,
    recv_count: AtomicU64,
    fault: Mutex<FaultWindow>,
}

impl NetworkTracker {
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            send_size: AtomicU64::new(0),
            send_count: AtomicU64::new(0),
            recv_size: AtomicU64::new(0),
            recv_count: AtomicU64::new(0),
            fault: Mutex::new(FaultWindow::default()),
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

    /// Arm send-fault injection: each send attempt independently fails with
    /// probability `chance`; an opened failure window persists for
    /// `blackout` before chance is re-evaluated.
    pub fn drop_send_requests(&self, chance: f64, blackout: Duration) {
        let mut fault = lock_unpoisoned(&self.fault);
        fault.injecting = true;
        fault.chance = chance.clamp(0.0, 1.0);
        fault.blackout = blackout;
        fault.open_until = None;
    }

    /// Disarm send-fault injection.
    pub fn dont_drop_send_requests(&self) {
        let mut fault = lock_unpoisoned(&self.fault);
        fault.injecting = false;
        fault.open_until = None;
    }

    /// Decide whether the current send attempt is rejected. Only consulted
    /// while tracking is active; engine-internal sends pass untouched.
    pub fn should_drop_send(&self) -> bool {
        if !self.active() {
            return false;
        }
        let _guard = ReentrancyGuard::enter();

        let mut fault = lock_unpoisoned(&self.fault);
        if !fault.injecting || fault.chance <= 0.0 {
            return false;
        }
        if let Some(until) = fault.open_until {
            if Instant::now() < until {
                return true;
            }
            fault.open_until = None;
        }
        if rand::random::<f64>() < fault.chance {
            fault.open_until = Some(Instant::now() + fault.blackout);
            return true;
        }
        false
    }

    pub fn record_send(&self, bytes: u64) {
        if !self.active() {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        self.send_size.fetch_add(bytes, Ordering::SeqCst);
        self.send_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_recv(&self, bytes: u64) {
        if !self.active() {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        self.recv_size.fetch_add(bytes, Ordering::SeqCst);
        self.recv_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Current counter values.
    pub fn usage(&self) -> NetworkUsage {
        NetworkUsage {
            send: Counter {
                size: self.send_size.load(Ordering::SeqCst),
                count: self.send_count.load(Ordering::SeqCst),
            },
            receive: Counter {
                size: self.recv_size.load(Ordering::SeqCst),
                count: self.recv_count.load(Ordering::SeqCst),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{force_disable, test_guard};
    use super::*;

    #[test]
    fn chance_zero_never_drops() {
        let _serial = test_guard();
        force_disable();
        super::super::enter();

        let tracker = super::super::network();
        tracker.drop_send_requests(0.0, Duration::from_millis(100));
        for _ in 0..1000 {
            assert!(!tracker.should_drop_send());
        }

        tracker.dont_drop_send_requests();
        super::super::exit();
    }

    #[test]
    fn chance_one_drops_every_attempt() {
        let _serial = test_guard();
        force_disable();
        super::super::enter();

        let tracker = super::super::network();
        tracker.drop_send_requests(1.0, Duration::from_secs(5));
        for _ in 0..1000 {
            assert!(tracker.should_drop_send());
        }

        tracker.dont_drop_send_requests();
        super::super::exit();
    }

    #[test]
    fn disarmed_injection_never_drops() {
        let _serial = test_guard();
        force_disable();
        super::super::enter();

        let tracker = super::super::network();
        tracker.drop_send_requests(1.0, Duration::from_secs(5));
        tracker.dont_drop_send_requests();
        assert!(!tracker.should_drop_send());

        super::super::exit();
    }

    #[test]
    fn counters_accumulate_per_direction() {
        let _serial = test_guard();
        force_disable();
        super::super::enter();

        let tracker = super::super::network();
        let before = tracker.usage();
        tracker.record_send(100);
        tracker.record_send(50);
        tracker.record_recv(25);
        let after = tracker.usage();

        super::super::exit();

        assert_eq!(after.send.size - before.send.size, 150);
        assert_eq!(after.send.count - before.send.count, 2);
        assert_eq!(after.receive.size - before.receive.size, 25);
        assert_eq!(after.receive.count - before.receive.count, 1);
    }

    #[test]
    fn disabled_tracker_neither_counts_nor_drops() {
        let _serial = test_guard();
        force_disable();

        let tracker = super::super::network();
        tracker.drop_send_requests(1.0, Duration::from_secs(5));
        let before = tracker.usage();
        assert!(!tracker.should_drop_send());
        tracker.record_send(64);
        let after = tracker.usage();
        tracker.dont_drop_send_requests();

        assert_eq!(before.send, after.send);
    }
}
