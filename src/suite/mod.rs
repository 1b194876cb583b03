//! Test declaration and execution layer.

pub mod exec;
pub mod record;
pub mod report;

use crate::monitor::{lock_unpoisoned, ReentrancyGuard};
use std::sync::Mutex;

/// Ordered error strings recorded by the currently executing body.
static ERRORS: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Record an error from inside a test body. The string is preserved
/// verbatim, surfaces the test as FAIL, and is always rendered in the
/// final report.
pub fn err(message: impl Into<String>) {
    // The strings outlive the tracked region; keep them off the body's
    // allocation accounting.
    let _guard = ReentrancyGuard::enter();
    lock_unpoisoned(&ERRORS).push(message.into());
}

/// Drain everything recorded since the last drain, in recording order.
pub(crate) fn drain_errors() -> Vec<String> {
    let _guard = ReentrancyGuard::enter();
    std::mem::take(&mut *lock_unpoisoned(&ERRORS))
}
