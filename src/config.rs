/// Per-test and suite-level configuration surface
use crate::types::Status;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-test execution options.
///
/// Populated by the registration builders; consumed by the execution layer
/// and the sandbox. Limits default to "unbounded" so a plain unit test only
/// pays for the checks it asked for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestOptions {
    /// Body time budget in nanoseconds
    pub timeout_ns: u64,
    /// Ceiling on the high-water mark of live bytes
    pub memory_bytes_limit: u64,
    /// Ceiling on the high-water mark of live blocks
    pub memory_blocks_limit: u64,
    /// Suppress the leak downgrade for bodies that intentionally leak
    pub ignore_memory_leak: bool,
    /// Run the body in-process instead of a forked child (debugging;
    /// instrumentation guarantees become best-effort)
    pub in_process: bool,
    /// Worker count for distributed tests (0 = suite default)
    pub workers: u16,
    /// Absolute performance margin in nanoseconds
    pub performance_margin_ns: u64,
    /// Performance margin as a fraction of baseline time (0 = use absolute)
    pub performance_margin_ratio: f64,
    /// Probability that a send attempt opens a fault window
    pub fault_chance: f64,
    /// Duration of an opened fault window, in milliseconds
    pub fault_blackout_ms: u64,
    /// Enable probabilistic send-fault injection for this test
    pub faulty_network: bool,
    /// Expected terminal status; a run ending in this non-PASS status is
    /// recorded as PASS so a test asserting its own failure mode does not
    /// block its module
    pub expect: Status,
    /// Restrict the resource snapshot to the body phase only
    pub snapshot_body_only: bool,
    /// Disabled tests are skipped by the scheduler
    pub enabled: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            timeout_ns: Duration::from_secs(10).as_nanos() as u64,
            memory_bytes_limit: u64::MAX,
            memory_blocks_limit: u64::MAX,
            ignore_memory_leak: false,
            in_process: false,
            workers: 0,
            performance_margin_ns: 1_000_000, // 1 ms
            performance_margin_ratio: 0.0,
            fault_chance: 0.0,
            fault_blackout_ms: 0,
            faulty_network: false,
            expect: Status::Pass,
            snapshot_body_only: false,
            enabled: true,
        }
    }
}

impl TestOptions {
    /// Effective performance margin for a measured baseline, in nanoseconds.
    pub fn performance_margin_for(&self, baseline_ns: u64) -> u64 {
        if self.performance_margin_ratio > 0.0 {
            (baseline_ns as f64 * self.performance_margin_ratio) as u64
        } else {
            self.performance_margin_ns
        }
    }
}

/// Suite-level configuration consumed by the scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Pool size used by distributed tests that do not name a worker count
    pub default_workers: u16,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self { default_workers: 4 }
    }
}
