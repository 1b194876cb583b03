//! Fatal-fault capture for the sandbox child.
//!
//! A fault handler is installed in the child immediately after it connects
//! back to its parent. On a fatal memory-access fault it disables tracking,
//! sends a structured error frame carrying a captured call stack over the
//! stored connection, and terminates the process — the parent is never left
//! waiting indefinitely on a crash.

use crate::monitor;
use crate::transport::message::{Message, SandboxCode};
use crate::types::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::backtrace::Backtrace;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// Connection back to the sandbox parent, set once in the child.
static CLIENT_FD: AtomicI32 = AtomicI32::new(-1);

/// Install the fault handler for the current (child) process.
pub(crate) fn install(client_fd: RawFd) -> Result<()> {
    CLIENT_FD.store(client_fd, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(fault_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGSEGV, &action)?;
        signal::sigaction(Signal::SIGBUS, &action)?;
    }
    Ok(())
}

/// Not async-signal-safe: formatting the trace allocates. The handler runs
/// only on the child's terminal path and never returns, and tracking is
/// disabled first so none of its own activity is attributed to the body.
extern "C" fn fault_handler(sig: libc::c_int) {
    monitor::force_disable();

    let name = Signal::try_from(sig)
        .map(|s| s.as_str())
        .unwrap_or("unknown signal");
    let trace = Backtrace::force_capture();
    let reason = format!("Detected fatal signal {}. Caused by:\n{}", name, trace);

    let mut message = Message::new();
    message.put(&SandboxCode::Error).put(&reason);

    let fd = CLIENT_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        emergency_send(fd, message.payload());
    }

    unsafe { libc::_exit(1) };
}

/// Write a length-prefixed frame with raw `libc::write`, bypassing any
/// buffered stream state the fault may have corrupted.
fn emergency_send(fd: RawFd, payload: &[u8]) {
    let header = (payload.len() as u32).to_le_bytes();
    write_all(fd, &header);
    write_all(fd, payload);
}

fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let written =
            unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}
