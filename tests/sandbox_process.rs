//! Process-level sandbox behavior: completion, crash containment,
//! unexpected termination, and driver-side timeout.
//!
//! Everything lives in one test function so the forking process stays
//! single-threaded.

use std::time::{Duration, Instant};
use testrig::sandbox::{self, SandboxOptions};

#[test]
fn forked_sandbox_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = SandboxOptions::default();

    // A completing body delivers its message to the parent intact.
    let mut decoded = 0u64;
    let finished = sandbox::run(
        Duration::from_secs(10),
        || {},
        |m| {
            m.put(&99u64).put(&"all good".to_string());
        },
        |m| {
            decoded = m.get::<u64>().unwrap();
            assert_eq!(m.get::<String>().unwrap(), "all good");
        },
        |reason| panic!("unexpected error: {}", reason),
        &options,
    )
    .unwrap();
    assert!(finished);
    assert_eq!(decoded, 99);

    // A fatal memory fault is contained: the parent gets a structured
    // error carrying a captured stack, well before its budget.
    let mut crash_reason = String::new();
    let started = Instant::now();
    let finished = sandbox::run(
        Duration::from_secs(30),
        || unsafe {
            std::ptr::null_mut::<u8>().write_volatile(1);
        },
        |_| {},
        |_| panic!("crashing body must not complete"),
        |reason| crash_reason = reason,
        &options,
    )
    .unwrap();
    assert!(finished);
    assert!(started.elapsed() < Duration::from_secs(10), "parent must not hang on a crash");
    assert!(crash_reason.contains("fatal signal"), "got: {}", crash_reason);
    assert!(crash_reason.contains("Caused by:"), "got: {}", crash_reason);
    let trace = crash_reason.split("Caused by:").nth(1).unwrap_or("");
    assert!(!trace.trim().is_empty(), "captured stack must be non-empty");

    // A panicking body surfaces as an uncaught-panic error.
    let mut panic_reason = String::new();
    sandbox::run(
        Duration::from_secs(10),
        || panic!("boom"),
        |_| {},
        |_| panic!("panicking body must not complete"),
        |reason| panic_reason = reason,
        &options,
    )
    .unwrap();
    assert!(panic_reason.contains("uncaught panic"), "got: {}", panic_reason);
    assert!(panic_reason.contains("boom"), "got: {}", panic_reason);

    // A typed abort carries its reason verbatim.
    let mut abort_reason = String::new();
    sandbox::run(
        Duration::from_secs(10),
        || sandbox::abort("resource exhausted"),
        |_| {},
        |_| panic!("aborting body must not complete"),
        |reason| abort_reason = reason,
        &options,
    )
    .unwrap();
    assert_eq!(abort_reason, "resource exhausted");

    // A child that dies without sending anything is reported, not waited
    // on forever.
    let mut death_reason = String::new();
    sandbox::run(
        Duration::from_secs(10),
        || std::process::exit(7),
        |_| {},
        |_| panic!("exiting body must not complete"),
        |reason| death_reason = reason,
        &options,
    )
    .unwrap();
    assert!(
        death_reason.contains("Terminated unexpectedly"),
        "got: {}",
        death_reason
    );

    // Budget expiry kills the child and reports an unfinished run.
    let started = Instant::now();
    let finished = sandbox::run(
        Duration::from_millis(500),
        || std::thread::sleep(Duration::from_secs(30)),
        |_| {},
        |_| panic!("sleeping body must not complete"),
        |reason| panic!("timeout is not an error: {}", reason),
        &options,
    )
    .unwrap();
    assert!(!finished);
    assert!(started.elapsed() < Duration::from_secs(10));
}
