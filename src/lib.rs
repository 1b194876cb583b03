//! testrig: a distributed test-execution engine
//!
//! Runs test bodies in isolated processes, measures their resource
//! footprint and fault behavior, enforces performance and leak budgets,
//! and coordinates multi-process tests across a pool of worker processes
//! under a dependency-ordered schedule.
//!
//! # Architecture
//!
//! Leaf-first:
//!
//! ## Transport ([`transport`])
//! - [`transport::socket`]: listening endpoints, connections, framing
//! - [`transport::message`]: the ordered, strongly-typed serialization
//!   buffer used for every cross-process exchange
//!
//! ## Resource instrumentation ([`monitor`])
//! - [`monitor::memory`]: allocation tracking with per-block call stacks
//! - [`monitor::network`]: send/receive counters and probabilistic
//!   send-fault injection
//! - [`monitor::hook`]: the pluggable allocation hook
//!
//! ## Sandbox ([`sandbox`])
//! - process-isolated execution of a test body, crash capture, snapshot
//!   diffing, reference-counted activation gate
//!
//! ## Test layer ([`suite`], [`registry`])
//! - [`suite::record`]: test records and the registration builder
//! - [`suite::exec`]: sandboxed execution plus post-hoc checks
//! - [`suite::report`]: the per-test detailed report
//!
//! ## Orchestration ([`driver`], [`worker`], [`context`])
//! - [`driver`]: worker pool, distributed dispatch, quorum wait
//! - [`driver::scheduler`]: the dependency-ordered top-level schedule
//! - [`worker`]: the persistent per-worker event loop
//! - [`context`]: role-dispatched notify/wait for test bodies
//!
//! # Design principles
//!
//! 1. **Isolation is the safety mechanism** - a crashing body can only
//!    terminate its own sandboxed child
//! 2. **One blocking primitive** - every suspension is an endpoint poll
//! 3. **Results never unwind across the boundary** - child outcomes arrive
//!    as structured frames or observed termination
//! 4. **Defensive orchestration** - malformed events are logged and
//!    ignored, never allowed to crash the driver

// Transport
pub mod transport;

// Resource instrumentation
pub mod monitor;

// Sandbox
pub mod sandbox;

// Test declaration and execution
pub mod registry;
pub mod suite;

// Orchestration
pub mod context;
pub mod driver;
pub mod worker;

// Configuration & shared types
pub mod config;
pub mod types;

// Utilities
pub mod utils;

// Re-export the surface test code touches most.
pub use config::{SuiteConfig, TestOptions};
pub use context::{is_driver, notify, wait, worker_id, WAIT_ALL};
pub use driver::scheduler::run_all;
pub use registry::declare_module;
pub use suite::err;
pub use suite::record::{TestBuilder, TestRecord};
pub use types::{ResourceSnapshot, Result, RigError, Status};
