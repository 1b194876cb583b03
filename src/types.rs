/// Core types and structures shared across the engine
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome of a single test execution.
///
/// A record starts `Pending` and ends in exactly one terminal value; the
/// execution path only ever moves it forward, never back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    /// Not yet executed
    Pending,
    /// Completed with all checks satisfied
    Pass,
    /// Completed, but the tracked region freed less than it allocated
    PassWithMemoryLeak,
    /// Body recorded an error, panicked, crashed, or terminated unexpectedly
    Fail,
    /// Exceeded the configured time budget
    Timeout,
    /// Exceeded the configured memory byte or block ceiling
    MemoryLimitExceeded,
    /// Exceeded the configured performance margin over baseline
    TooSlow,
}

impl Status {
    /// Summary-line form used in the suite tally.
    pub fn past_tense(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Pass => "PASSED",
            Status::PassWithMemoryLeak => "PASSED (with memory leak)",
            Status::Fail => "FAILED",
            Status::Timeout => "TIMED OUT",
            Status::MemoryLimitExceeded => "EXCEEDED MEMORY LIMIT",
            Status::TooSlow => "RAN TOO SLOW",
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::Pass => 1,
            Status::PassWithMemoryLeak => 2,
            Status::Fail => 3,
            Status::Timeout => 4,
            Status::MemoryLimitExceeded => 5,
            Status::TooSlow => 6,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Status::Pending,
            1 => Status::Pass,
            2 => Status::PassWithMemoryLeak,
            3 => Status::Fail,
            4 => Status::Timeout,
            5 => Status::MemoryLimitExceeded,
            6 => Status::TooSlow,
            other => {
                return Err(RigError::Protocol(format!(
                    "unknown status byte: {}",
                    other
                )))
            }
        })
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Pending
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "PENDING",
            Status::Pass => "PASS",
            Status::PassWithMemoryLeak => "PASS (with memory leak)",
            Status::Fail => "FAIL",
            Status::Timeout => "TIMEOUT",
            Status::MemoryLimitExceeded => "MEMORY LIMIT EXCEEDED",
            Status::TooSlow => "TOO SLOW",
        };
        f.write_str(s)
    }
}

/// One size/count counter pair.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Total bytes
    pub size: u64,
    /// Total events (blocks or packets)
    pub count: u64,
}

/// Memory activity counters for a tracked region.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Bytes/blocks acquired
    pub allocate: Counter,
    /// Bytes/blocks released
    pub deallocate: Counter,
    /// High-water mark of simultaneously live bytes/blocks
    pub max: Counter,
}

/// Network activity counters for a tracked region.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkUsage {
    /// Bytes/packets written
    pub send: Counter,
    /// Bytes/packets read
    pub receive: Counter,
}

/// Point-in-time or delta view of memory and network activity.
///
/// Callers take a "before" snapshot, run a region, then pass the same value
/// to [`crate::sandbox::resource_snapshot`], which replaces each flow counter
/// with (current - previous). The high-water pair is always the absolute
/// peak observed, not a difference.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory: MemoryUsage,
    pub network: NetworkUsage,
}

/// Custom error types for testrig
#[derive(Error, Debug)]
pub enum RigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("send dropped by network fault injection")]
    FaultInjected,
}

impl From<nix::errno::Errno> for RigError {
    fn from(err: nix::errno::Errno) -> Self {
        RigError::Process(err.to_string())
    }
}

/// Result type alias for testrig operations
pub type Result<T> = std::result::Result<T, RigError>;
