//! Role-dispatched synchronization primitives for test bodies.
//!
//! A distributed test body calls [`notify`] and [`wait`] without caring
//! whether it is running on the driver or on a worker; the process role,
//! claimed at driver start or worker start, routes the call.

use crate::types::Result;
use crate::{driver, worker};
use std::sync::atomic::{AtomicU8, Ordering};

/// Pass to [`wait`] to wait on every allocated worker (driver) or default
/// to a single notification (worker).
pub const WAIT_ALL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Driver,
    Worker,
}

static ROLE: AtomicU8 = AtomicU8::new(0);

pub(crate) fn set_role(role: Role) {
    ROLE.store(
        match role {
            Role::Driver => 0,
            Role::Worker => 1,
        },
        Ordering::SeqCst,
    );
}

fn role() -> Role {
    match ROLE.load(Ordering::SeqCst) {
        1 => Role::Worker,
        _ => Role::Driver,
    }
}

/// True in the coordinating process, false in a worker.
pub fn is_driver() -> bool {
    role() == Role::Driver
}

/// Id of the current worker; `None` on the driver.
pub fn worker_id() -> Option<u32> {
    match role() {
        Role::Driver => None,
        Role::Worker => worker::id(),
    }
}

/// Broadcast a notify signal: from the driver, to all allocated workers;
/// from a worker, to the driver.
pub fn notify() -> Result<()> {
    match role() {
        Role::Driver => driver::notify(),
        Role::Worker => worker::notify(),
    }
}

/// Block until `n` notifications are available.
///
/// On the driver this is a quorum gate: it returns once `n` *distinct*
/// allocated workers have each accumulated at least one pending
/// notification, consuming one per satisfied worker. On a worker it blocks
/// until the local counter reaches `n`, then subtracts `n`.
pub fn wait(n: u32) -> Result<()> {
    match role() {
        Role::Driver => driver::wait(n),
        Role::Worker => worker::wait(n),
    }
}
