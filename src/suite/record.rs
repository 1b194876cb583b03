//! Test records and the registration builder.

use crate::config::TestOptions;
use crate::registry;
use crate::types::{ResourceSnapshot, Status};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// A callable test phase. Closures are shared by reference-counting so a
/// record can be copied for each execution without duplicating the code.
pub type Body = Arc<dyn Fn() + Send + Sync + 'static>;

/// What the execution engine does with a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestKind {
    Unit,
    Performance,
    Distributed,
}

/// One registered test: identity, dependencies, phases, options, and the
/// mutable execution state filled in by a run.
///
/// The registry holds the clean template; the scheduler and workers copy it
/// before every execution so repeated runs always start from `Pending`.
#[derive(Clone)]
pub struct TestRecord {
    pub(crate) module: String,
    pub(crate) name: String,
    pub(crate) dependencies: BTreeSet<String>,
    pub(crate) kind: TestKind,
    pub(crate) options: TestOptions,
    pub(crate) on_init: Option<Body>,
    pub(crate) body: Body,
    pub(crate) on_complete: Option<Body>,
    pub(crate) baseline: Option<Body>,
    pub(crate) worker_body: Option<Body>,

    // Execution state
    pub(crate) status: Status,
    pub(crate) errors: Vec<String>,
    pub(crate) init_time: u64,
    pub(crate) body_time: u64,
    pub(crate) complete_time: u64,
    pub(crate) baseline_time: u64,
    pub(crate) used: ResourceSnapshot,
    pub(crate) child_status: Vec<Status>,
    pub(crate) child_reports: Vec<String>,
    pub(crate) report: String,
}

impl TestRecord {
    fn new(module: impl Into<String>, name: impl Into<String>, kind: TestKind) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            dependencies: BTreeSet::new(),
            kind,
            options: TestOptions::default(),
            on_init: None,
            body: Arc::new(|| {}),
            on_complete: None,
            baseline: None,
            worker_body: None,
            status: Status::Pending,
            errors: Vec::new(),
            init_time: 0,
            body_time: 0,
            complete_time: 0,
            baseline_time: 0,
            used: ResourceSnapshot::default(),
            child_status: Vec::new(),
            child_reports: Vec::new(),
            report: String::new(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn resource_usage(&self) -> &ResourceSnapshot {
        &self.used
    }

    /// Per-worker statuses of a distributed run, in worker-id order.
    pub fn child_status(&self) -> &[Status] {
        &self.child_status
    }

    pub fn child_reports(&self) -> &[String] {
        &self.child_reports
    }

    pub fn report(&self) -> &str {
        &self.report
    }
}

/// Fluent registration builder.
///
/// Builders are created with [`TestBuilder::unit`],
/// [`TestBuilder::performance`], or [`TestBuilder::distributed`], configured,
/// and handed to the process-wide registry with [`register`](Self::register)
/// during process initialization.
pub struct TestBuilder {
    record: TestRecord,
}

impl TestBuilder {
    /// A single-process test.
    pub fn unit(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record: TestRecord::new(module, name, TestKind::Unit),
        }
    }

    /// A test whose body time is compared against a measured baseline.
    pub fn performance(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record: TestRecord::new(module, name, TestKind::Performance),
        }
    }

    /// A test fanned out across a pool of worker processes.
    pub fn distributed(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record: TestRecord::new(module, name, TestKind::Distributed),
        }
    }

    /// Modules whose tests must all pass before this test becomes ready.
    pub fn depends_on<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record
            .dependencies
            .extend(modules.into_iter().map(Into::into));
        self
    }

    pub fn on_init(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.record.on_init = Some(Arc::new(f));
        self
    }

    pub fn body(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.record.body = Arc::new(f);
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.record.on_complete = Some(Arc::new(f));
        self
    }

    /// Reference workload for performance comparison.
    pub fn baseline(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.record.baseline = Some(Arc::new(f));
        self
    }

    /// Body executed on workers for a distributed test; defaults to the
    /// driver body.
    pub fn worker_body(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.record.worker_body = Some(Arc::new(f));
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.timeout_nanos(timeout.as_nanos() as u64)
    }

    pub fn timeout_millis(self, millis: u64) -> Self {
        self.timeout_nanos(millis * 1_000_000)
    }

    pub fn timeout_nanos(mut self, nanos: u64) -> Self {
        self.record.options.timeout_ns = nanos;
        self
    }

    pub fn memory_bytes_limit(mut self, bytes: u64) -> Self {
        self.record.options.memory_bytes_limit = bytes;
        self
    }

    pub fn memory_blocks_limit(mut self, blocks: u64) -> Self {
        self.record.options.memory_blocks_limit = blocks;
        self
    }

    pub fn ignore_memory_leak(mut self, value: bool) -> Self {
        self.record.options.ignore_memory_leak = value;
        self
    }

    pub fn in_process(mut self, value: bool) -> Self {
        self.record.options.in_process = value;
        self
    }

    pub fn workers(mut self, count: u16) -> Self {
        self.record.options.workers = count;
        self
    }

    pub fn performance_margin(self, margin: Duration) -> Self {
        self.performance_margin_nanos(margin.as_nanos() as u64)
    }

    pub fn performance_margin_millis(self, millis: u64) -> Self {
        self.performance_margin_nanos(millis * 1_000_000)
    }

    pub fn performance_margin_nanos(mut self, nanos: u64) -> Self {
        self.record.options.performance_margin_ns = nanos;
        self
    }

    /// Margin expressed as a fraction of the measured baseline time.
    pub fn performance_margin_as_baseline_ratio(mut self, ratio: f64) -> Self {
        self.record.options.performance_margin_ratio = ratio;
        self
    }

    /// Arm probabilistic send-fault injection for this test.
    pub fn faulty_network(mut self, chance: f64, blackout: Duration) -> Self {
        self.record.options.faulty_network = true;
        self.record.options.fault_chance = chance;
        self.record.options.fault_blackout_ms = blackout.as_millis() as u64;
        self
    }

    /// Declare the terminal status this test is expected to end in.
    pub fn expect(mut self, status: Status) -> Self {
        self.record.options.expect = status;
        self
    }

    pub fn snapshot_body_only(mut self, value: bool) -> Self {
        self.record.options.snapshot_body_only = value;
        self
    }

    pub fn disable(mut self) -> Self {
        self.record.options.enabled = false;
        self
    }

    /// Hand the record to the process-wide registry.
    pub fn register(self) {
        registry::register(self.record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_options() {
        let builder = TestBuilder::performance("mod", "perf")
            .depends_on(["base"])
            .timeout(Duration::from_secs(3))
            .performance_margin_as_baseline_ratio(0.7)
            .memory_bytes_limit(1024)
            .ignore_memory_leak(true)
            .body(|| {})
            .baseline(|| {});

        let record = &builder.record;
        assert_eq!(record.kind, TestKind::Performance);
        assert!(record.dependencies.contains("base"));
        assert_eq!(record.options.timeout_ns, 3_000_000_000);
        assert_eq!(record.options.performance_margin_ratio, 0.7);
        assert_eq!(record.options.memory_bytes_limit, 1024);
        assert!(record.options.ignore_memory_leak);
        assert!(record.baseline.is_some());
    }

    #[test]
    fn record_copy_starts_clean() {
        let mut template = TestRecord::new("mod", "t", TestKind::Unit);
        template.status = Status::Pending;

        let mut first_run = template.clone();
        first_run.status = Status::Fail;
        first_run.errors.push("boom".to_string());

        let second_run = template.clone();
        assert_eq!(second_run.status, Status::Pending);
        assert!(second_run.errors.is_empty());
    }
}
