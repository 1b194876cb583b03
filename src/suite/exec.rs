//! Single-test execution inside the sandbox, plus the post-hoc resource
//! and performance checks.

use crate::config::TestOptions;
use crate::monitor;
use crate::sandbox::{self, SandboxOptions};
use crate::suite::record::{Body, TestKind, TestRecord};
use crate::suite::report;
use crate::transport::message::Message;
use crate::types::{Result, ResourceSnapshot, Status};
use crate::utils::fmt::{format_duration, format_size};
use crate::utils::time::time_of;
use std::cell::RefCell;
use std::time::Duration;

/// Floor on the sandbox polling budget; short test timeouts are still
/// enforced against the measured body time.
const MIN_SANDBOX_BUDGET_NS: u64 = 2_000_000_000;

/// Execution scratchpad shared by the body and completion closures.
#[derive(Default)]
struct Scratch {
    status: Status,
    used: ResourceSnapshot,
    init_time: u64,
    body_time: u64,
    complete_time: u64,
    baseline_time: u64,
    errors: Vec<String>,
}

/// Fields of a decoded `Complete` frame, in wire order.
struct Decoded {
    status: Status,
    used: ResourceSnapshot,
    errors: Vec<String>,
    init_time: u64,
    body_time: u64,
    complete_time: u64,
    baseline_time: u64,
}

fn decode_complete(message: &mut Message) -> Result<Decoded> {
    Ok(Decoded {
        status: message.get()?,
        used: message.get()?,
        errors: message.get()?,
        init_time: message.get()?,
        body_time: message.get()?,
        complete_time: message.get()?,
        baseline_time: message.get()?,
    })
}

/// Run one record to completion and fill in its execution state.
///
/// `use_worker_body` selects the worker-side body of a distributed test;
/// `force_inline` keeps the body in-process regardless of its options (used
/// for distributed driver bodies, whose notify/wait calls must operate on
/// the live worker pool).
pub(crate) fn execute(
    record: &mut TestRecord,
    use_worker_body: bool,
    force_inline: bool,
) -> Result<()> {
    let options = record.options.clone();
    let kind = record.kind;
    let on_init = record.on_init.clone();
    let on_cleanup = record.on_complete.clone();
    let baseline = record.baseline.clone();
    let body: Body = if use_worker_body {
        record
            .worker_body
            .clone()
            .unwrap_or_else(|| record.body.clone())
    } else {
        record.body.clone()
    };

    let sandbox_options = SandboxOptions {
        fork: !(options.in_process || force_inline),
    };
    let budget = Duration::from_nanos(options.timeout_ns.max(MIN_SANDBOX_BUDGET_NS));

    let scratch = RefCell::new(Scratch::default());
    let mut decoded: Option<Result<Decoded>> = None;
    let mut failure: Option<String> = None;

    let finished = sandbox::run(
        budget,
        || {
            configure_network(&options);

            let mut s = scratch.borrow_mut();
            // A crash or abort from here on reports as a failure.
            s.status = Status::Fail;

            if !options.snapshot_body_only {
                sandbox::resource_snapshot(&mut s.used);
            }
            if let Some(init) = &on_init {
                s.init_time = time_of(&**init);
            }
            if let Some(base) = &baseline {
                s.baseline_time = time_of(&**base);
            }
            if options.snapshot_body_only {
                sandbox::resource_snapshot(&mut s.used);
            }
            s.body_time = time_of(&*body);
            if options.snapshot_body_only {
                sandbox::resource_snapshot(&mut s.used);
            }
            if let Some(cleanup) = &on_cleanup {
                s.complete_time = time_of(&**cleanup);
            }
            if !options.snapshot_body_only {
                sandbox::resource_snapshot(&mut s.used);
            }

            s.status = Status::Pass;
        },
        |message| {
            let mut s = scratch.borrow_mut();
            s.errors.extend(crate::suite::drain_errors());
            run_checks(&mut s, &options, kind);
            message
                .put(&s.status)
                .put(&s.used)
                .put(&s.errors)
                .put(&s.init_time)
                .put(&s.body_time)
                .put(&s.complete_time)
                .put(&s.baseline_time);
        },
        |message| {
            decoded = Some(decode_complete(message));
        },
        |reason| {
            failure = Some(reason);
        },
        &sandbox_options,
    )?;

    if let Some(result) = decoded {
        match result {
            Ok(d) => {
                record.status = d.status;
                record.used = d.used;
                record.errors.extend(d.errors);
                record.init_time = d.init_time;
                record.body_time = d.body_time;
                record.complete_time = d.complete_time;
                record.baseline_time = d.baseline_time;
            }
            Err(e) => {
                record.status = Status::Fail;
                record.errors.push(format!("malformed result frame: {}", e));
            }
        }
    }
    if let Some(reason) = failure {
        record.status = Status::Fail;
        record.errors.push(reason);
    }
    if !finished {
        // Timeout is tracked independently of any error text.
        record.status = Status::Timeout;
    }

    apply_expectation(record);
    record.report = report::detailed(record);
    Ok(())
}

fn configure_network(options: &TestOptions) {
    let network = monitor::network();
    if options.faulty_network {
        network.drop_send_requests(
            options.fault_chance,
            Duration::from_millis(options.fault_blackout_ms),
        );
    } else {
        network.dont_drop_send_requests();
    }
}

fn run_checks(s: &mut Scratch, options: &TestOptions, kind: TestKind) {
    if !s.errors.is_empty() {
        s.status = Status::Fail;
    }
    check_memory_leak(s, options);
    check_memory_limits(s, options);
    check_timeout(s, options);
    if kind == TestKind::Performance {
        check_performance(s, options);
    }
}

fn check_memory_leak(s: &mut Scratch, options: &TestOptions) {
    if options.ignore_memory_leak || s.status != Status::Pass {
        return;
    }
    let memory = &s.used.memory;
    if memory.allocate.size > memory.deallocate.size {
        s.status = Status::PassWithMemoryLeak;
        s.errors.push(format!(
            "WARNING - possible memory leak detected: {} ({} block(s)) difference.{}",
            format_size(memory.allocate.size - memory.deallocate.size),
            memory.allocate.count.saturating_sub(memory.deallocate.count),
            monitor::memory().leak_report()
        ));
    }
}

fn check_memory_limits(s: &mut Scratch, options: &TestOptions) {
    if s.used.memory.max.size > options.memory_bytes_limit {
        s.status = Status::MemoryLimitExceeded;
        s.errors.push(format!(
            "WARNING - exceeded memory limit of {}",
            format_size(options.memory_bytes_limit)
        ));
    }
    if s.used.memory.max.count > options.memory_blocks_limit {
        s.status = Status::MemoryLimitExceeded;
        s.errors.push(format!(
            "WARNING - exceeded memory limit of {} blocks",
            options.memory_blocks_limit
        ));
    }
}

fn check_timeout(s: &mut Scratch, options: &TestOptions) {
    if s.body_time > options.timeout_ns {
        s.status = Status::Timeout;
        s.errors.push(format!(
            "Exceeded timeout of {}",
            format_duration(options.timeout_ns)
        ));
    }
}

fn check_performance(s: &mut Scratch, options: &TestOptions) {
    if s.status != Status::Pass && s.status != Status::PassWithMemoryLeak {
        return;
    }
    let margin = options.performance_margin_for(s.baseline_time);
    if s.body_time > s.baseline_time + margin {
        s.status = Status::TooSlow;
        s.errors.push(format!(
            "Exceeded baseline time of {} + {} margin: body took {}",
            format_duration(s.baseline_time),
            format_duration(margin),
            format_duration(s.body_time)
        ));
    }
}

/// A test may declare the terminal status it is expected to end in; a run
/// matching that declaration is recorded as a pass so the test does not
/// block its module, while a mismatch is a failure in its own right.
fn apply_expectation(record: &mut TestRecord) {
    let expected = record.options.expect;
    if expected == Status::Pass {
        return;
    }
    if record.status == expected {
        record.status = Status::Pass;
    } else {
        let actual = record.status;
        record.status = Status::Fail;
        record.errors.push(format!(
            "expected terminal status {} but finished with {}",
            expected, actual
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::test_guard;
    use crate::suite::record::TestBuilder;

    fn run_inline(builder: TestBuilder) -> TestRecord {
        let mut record = builder_record(builder);
        execute(&mut record, false, true).unwrap();
        record
    }

    fn builder_record(builder: TestBuilder) -> TestRecord {
        // Builders normally hand records to the registry; tests execute
        // them directly.
        crate::registry::clear();
        builder.register();
        let record = crate::registry::schedule_snapshot().remove(0);
        crate::registry::clear();
        record
    }

    #[test]
    fn passing_body_reports_pass_with_timings() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::suite::drain_errors();

        let record = run_inline(
            TestBuilder::unit("exec", "pass")
                .on_init(|| {})
                .body(|| std::thread::sleep(Duration::from_millis(5)))
                .on_complete(|| {}),
        );

        assert_eq!(record.status(), Status::Pass);
        assert!(record.body_time >= 5_000_000);
        assert!(record.errors().is_empty());
        assert!(record.report().contains("body"));
    }

    #[test]
    fn recorded_error_string_fails_the_test_verbatim() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::suite::drain_errors();

        let record = run_inline(
            TestBuilder::unit("exec", "err").body(|| crate::suite::err("expected 4, found 5")),
        );

        assert_eq!(record.status(), Status::Fail);
        assert_eq!(record.errors(), ["expected 4, found 5"]);
    }

    #[test]
    fn leaked_allocation_downgrades_pass() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::monitor::memory().clear();
        crate::suite::drain_errors();

        let record = run_inline(TestBuilder::unit("exec", "leak").body(|| {
            crate::monitor::memory().record_alloc(0x9000, 4096);
        }));
        crate::monitor::memory().clear();

        assert_eq!(record.status(), Status::PassWithMemoryLeak);
        assert!(record.errors()[0].contains("possible memory leak"));
        assert!(record.errors()[0].contains("4.00 KiB"));
    }

    #[test]
    fn ignored_leak_still_passes() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::monitor::memory().clear();
        crate::suite::drain_errors();

        let record = run_inline(
            TestBuilder::unit("exec", "leak-ok")
                .ignore_memory_leak(true)
                .body(|| {
                    crate::monitor::memory().record_alloc(0xa000, 4096);
                }),
        );
        crate::monitor::memory().clear();

        assert_eq!(record.status(), Status::Pass);
    }

    #[test]
    fn high_water_over_limit_is_memory_limit_exceeded() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::monitor::memory().clear();
        crate::suite::drain_errors();

        let record = run_inline(
            TestBuilder::unit("exec", "over")
                .memory_bytes_limit(1024)
                .ignore_memory_leak(true)
                .body(|| {
                    crate::monitor::memory().record_alloc(0xb000, 64 * 1024);
                    crate::monitor::memory().record_dealloc(0xb000);
                }),
        );
        crate::monitor::memory().clear();

        assert_eq!(record.status(), Status::MemoryLimitExceeded);
    }

    #[test]
    fn slow_body_times_out_against_measured_time() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::suite::drain_errors();

        let record = run_inline(
            TestBuilder::unit("exec", "slow")
                .timeout_millis(5)
                .body(|| std::thread::sleep(Duration::from_millis(25))),
        );

        assert_eq!(record.status(), Status::Timeout);
    }

    #[test]
    fn performance_margin_classifies_too_slow() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::suite::drain_errors();

        let record = run_inline(
            TestBuilder::performance("exec", "too-slow")
                .performance_margin_as_baseline_ratio(0.7)
                .baseline(|| std::thread::sleep(Duration::from_millis(5)))
                .body(|| std::thread::sleep(Duration::from_millis(40))),
        );
        assert_eq!(record.status(), Status::TooSlow);

        let record = run_inline(
            TestBuilder::performance("exec", "fast-enough")
                .performance_margin_as_baseline_ratio(0.7)
                .baseline(|| std::thread::sleep(Duration::from_millis(40)))
                .body(|| std::thread::sleep(Duration::from_millis(5))),
        );
        assert_eq!(record.status(), Status::Pass);
    }

    #[test]
    fn expected_failure_mode_counts_as_pass() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::suite::drain_errors();

        let record = run_inline(
            TestBuilder::performance("exec", "expected-slow")
                .expect(Status::TooSlow)
                .performance_margin_as_baseline_ratio(0.7)
                .baseline(|| std::thread::sleep(Duration::from_millis(5)))
                .body(|| std::thread::sleep(Duration::from_millis(40))),
        );
        assert_eq!(record.status(), Status::Pass);

        // Meeting the margin when TooSlow was declared is itself a failure.
        let record = run_inline(
            TestBuilder::performance("exec", "unexpectedly-fast")
                .expect(Status::TooSlow)
                .performance_margin_as_baseline_ratio(0.7)
                .baseline(|| std::thread::sleep(Duration::from_millis(40)))
                .body(|| std::thread::sleep(Duration::from_millis(5))),
        );
        assert_eq!(record.status(), Status::Fail);
        assert!(record.errors()[0].contains("expected terminal status"));
    }

    #[test]
    fn panicking_body_fails_with_diagnostic() {
        let _serial = test_guard();
        crate::monitor::force_disable();
        crate::suite::drain_errors();

        let record =
            run_inline(TestBuilder::unit("exec", "panic").body(|| panic!("index out of range")));

        assert_eq!(record.status(), Status::Fail);
        assert!(record.errors()[0].contains("uncaught panic"));
        assert!(record.errors()[0].contains("index out of range"));
    }
}
