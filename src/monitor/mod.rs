//! Process-wide resource instrumentation.
//!
//! Two singleton trackers ([`memory::MemoryTracker`], [`network::NetworkTracker`])
//! observe allocation and network activity while a sandbox region is active.
//! Both are guarded by:
//!
//! - an enable flag toggled only through the reference-counted activation
//!   gate ([`enter`]/[`exit`]), so nested sandbox regions only toggle
//!   tracking on the outermost transition;
//! - a thread-local reentrancy depth ([`ReentrancyGuard`]) that suppresses
//!   tracking of allocations and sends made by the engine itself, so the
//!   trackers never recurse into themselves or pollute their own counters.

pub mod hook;
pub mod memory;
pub mod network;

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use memory::MemoryTracker;
use network::NetworkTracker;

static MEMORY: OnceLock<MemoryTracker> = OnceLock::new();
static NETWORK: OnceLock<NetworkTracker> = OnceLock::new();

/// The process-wide memory tracker.
pub fn memory() -> &'static MemoryTracker {
    MEMORY.get_or_init(MemoryTracker::new)
}

/// The process-wide network tracker.
pub fn network() -> &'static NetworkTracker {
    NETWORK.get_or_init(NetworkTracker::new)
}

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True while the current thread is inside engine code whose resource
/// activity must not be attributed to the test body.
pub(crate) fn guard_active() -> bool {
    GUARD_DEPTH.with(|d| d.get()) > 0
}

/// RAII reentrancy guard. While held, the current thread's allocations and
/// network activity bypass the trackers.
pub struct ReentrancyGuard;

impl ReentrancyGuard {
    pub fn enter() -> Self {
        GUARD_DEPTH.with(|d| d.set(d.get() + 1));
        ReentrancyGuard
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Activation depth for the sandbox region gate.
static GATE_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Enter an instrumented region. Tracking turns on only on the 0 -> 1
/// transition, so a sandbox invoked from within another sandboxed context
/// does not corrupt the outer region's accounting.
pub fn enter() {
    if GATE_DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
        memory().set_enabled(true);
        network().set_enabled(true);
    }
}

/// Leave an instrumented region. Tracking turns off only on the 1 -> 0
/// transition.
pub fn exit() {
    let prev = GATE_DEPTH.fetch_sub(1, Ordering::SeqCst);
    if prev == 1 {
        memory().set_enabled(false);
        network().set_enabled(false);
    } else if prev == 0 {
        // Unbalanced exit; clamp rather than wrap.
        GATE_DEPTH.store(0, Ordering::SeqCst);
    }
}

/// Unconditionally disable tracking and reset the gate. Used by the abort
/// and crash paths, where the region is being abandoned mid-flight.
pub fn force_disable() {
    GATE_DEPTH.store(0, Ordering::SeqCst);
    memory().set_enabled(false);
    network().set_enabled(false);
}

/// Lock a mutex, recovering the data from a poisoned lock instead of
/// propagating the panic.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Serializes unit tests that toggle the process-wide trackers.
#[cfg(test)]
pub(crate) fn test_guard() -> MutexGuard<'static, ()> {
    static TEST_LOCK: Mutex<()> = Mutex::new(());
    lock_unpoisoned(&TEST_LOCK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_toggles_only_on_outermost_transition() {
        let _serial = test_guard();
        force_disable();

        enter();
        assert!(memory().is_enabled());
        enter(); // nested region
        assert!(memory().is_enabled());
        exit();
        assert!(memory().is_enabled(), "inner exit must not disable tracking");
        exit();
        assert!(!memory().is_enabled());
    }

    #[test]
    fn reentrancy_guard_nests() {
        assert!(!guard_active());
        {
            let _outer = ReentrancyGuard::enter();
            assert!(guard_active());
            {
                let _inner = ReentrancyGuard::enter();
                assert!(guard_active());
            }
            assert!(guard_active());
        }
        assert!(!guard_active());
    }

    #[test]
    fn force_disable_resets_nested_gate() {
        let _serial = test_guard();

        enter();
        enter();
        force_disable();
        assert!(!memory().is_enabled());
        assert!(!network().is_enabled());

        // The gate restarts cleanly from zero.
        enter();
        assert!(memory().is_enabled());
        exit();
        assert!(!memory().is_enabled());
    }
}
