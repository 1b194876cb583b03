//! Process-isolated execution of a callable body.
//!
//! [`run`] executes a body in a forked child (or in-process for debugging),
//! wires resource tracking around it, captures crashes and panics, and
//! delivers a structured result to the caller over the transport. Nothing
//! ever unwinds across the isolation boundary: every child outcome arrives
//! as either a `Complete` or an `Error` frame, or as observed child death.

mod fault;

use crate::monitor;
use crate::transport::message::{Message, SandboxCode};
use crate::transport::socket::{Connection, Endpoint};
use crate::types::{Result, ResourceSnapshot, RigError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How often the parent alternates between the endpoint and the child's
/// exit status.
const PARENT_POLL: Duration = Duration::from_millis(20);

/// Window granted for a result frame that raced with child exit.
const FINAL_DRAIN: Duration = Duration::from_millis(200);

/// Execution constraints for one sandbox run.
#[derive(Clone, Debug)]
pub struct SandboxOptions {
    /// Run the body in a forked child. When disabled the body runs
    /// in-process (useful for debugging); isolation and instrumentation
    /// guarantees are then best-effort.
    pub fork: bool,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self { fork: true }
    }
}

/// Typed abort payload recognized by the sandbox; see [`abort`].
pub struct SandboxAbort {
    reason: String,
}

/// Abort the current sandboxed body with a reason.
///
/// Tracking is disabled on this path before unwinding begins, so the abort
/// machinery itself is never attributed to the body.
pub fn abort(reason: impl Into<String>) -> ! {
    monitor::force_disable();
    panic::panic_any(SandboxAbort {
        reason: reason.into(),
    });
}

/// Re-exported activation gate: see [`monitor::enter`].
pub fn enter() {
    monitor::enter();
}

/// Re-exported activation gate: see [`monitor::exit`].
pub fn exit() {
    monitor::exit();
}

/// In-place snapshot diff: replaces each flow counter of `snapshot` with
/// (current tracker value - previous value stored in `snapshot`); the
/// memory high-water pair is set to the absolute peak observed. Take a
/// "before" snapshot, run a region, then reuse the same value to obtain the
/// delta.
pub fn resource_snapshot(snapshot: &mut ResourceSnapshot) {
    let memory = monitor::memory().usage();
    let network = monitor::network().usage();

    snapshot.memory.allocate.size = memory.allocate.size.wrapping_sub(snapshot.memory.allocate.size);
    snapshot.memory.allocate.count =
        memory.allocate.count.wrapping_sub(snapshot.memory.allocate.count);
    snapshot.memory.deallocate.size =
        memory.deallocate.size.wrapping_sub(snapshot.memory.deallocate.size);
    snapshot.memory.deallocate.count = memory
        .deallocate
        .count
        .wrapping_sub(snapshot.memory.deallocate.count);
    snapshot.memory.max = memory.max;

    snapshot.network.send.size = network.send.size.wrapping_sub(snapshot.network.send.size);
    snapshot.network.send.count = network.send.count.wrapping_sub(snapshot.network.send.count);
    snapshot.network.receive.size =
        network.receive.size.wrapping_sub(snapshot.network.receive.size);
    snapshot.network.receive.count = network
        .receive
        .count
        .wrapping_sub(snapshot.network.receive.count);
}

/// Execute `body` under the sandbox contract.
///
/// Returns `Ok(true)` when a result was delivered (success or error) and
/// `Ok(false)` when the budget expired first; on expiry the child is killed
/// and reaped rather than left running detached.
///
/// - `on_complete` runs where the body ran and appends the result fields to
///   a `Complete` message;
/// - `on_success` decodes that message on the caller's side;
/// - `on_error` receives the reason string of any failure outcome.
pub fn run<B, C, S, E>(
    budget: Duration,
    body: B,
    on_complete: C,
    on_success: S,
    on_error: E,
    options: &SandboxOptions,
) -> Result<bool>
where
    B: FnOnce(),
    C: FnOnce(&mut Message),
    S: FnOnce(&mut Message),
    E: FnOnce(String),
{
    if !options.fork {
        return run_inline(body, on_complete, on_success, on_error);
    }

    let run_id = Uuid::new_v4();
    let mut endpoint = Endpoint::bind()?;
    let address = endpoint.address()?;
    log::debug!("sandbox {} listening on {}", run_id, address);

    match unsafe { fork() }.map_err(|e| RigError::Process(format!("fork(sandbox): {}", e)))? {
        ForkResult::Child => {
            drop(endpoint);
            run_child(address, body, on_complete);
        }
        ForkResult::Parent { child } => {
            log::debug!("sandbox {} forked child {}", run_id, child);
            run_parent(&mut endpoint, child, budget, on_success, on_error)
        }
    }
}

/// Child side: connect back, arm fault capture, run the body inside the
/// activation gate, and report exactly one outcome frame.
fn run_child<B, C>(address: std::net::SocketAddr, body: B, on_complete: C) -> !
where
    B: FnOnce(),
    C: FnOnce(&mut Message),
{
    let mut conn = match Connection::connect(address) {
        Ok(conn) => conn,
        Err(_) => std::process::exit(1),
    };
    if fault::install(conn.raw_fd()).is_err() {
        std::process::exit(1);
    }

    // The outcome frame is the only channel back to the parent; panic
    // output would interleave with the host process's streams.
    panic::set_hook(Box::new(|_| {}));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        enter();
        body();
        exit();
    }));

    let mut message = Message::new();
    match outcome {
        Ok(()) => {
            message.put(&SandboxCode::Complete);
            on_complete(&mut message);
        }
        Err(payload) => {
            if let Some(abort) = payload.downcast_ref::<SandboxAbort>() {
                // abort() already disabled tracking on the signaling path.
                message.put(&SandboxCode::Error).put(&abort.reason);
            } else {
                monitor::force_disable();
                let text = panic_text(payload.as_ref());
                message
                    .put(&SandboxCode::Error)
                    .put(&format!("Detected uncaught panic: {}", text));
            }
        }
    }

    let _ = conn.send(&message);
    conn.close();

    // The process is ending regardless; drop the block bookkeeping so the
    // table is not reported as engine state.
    monitor::memory().clear();
    std::process::exit(0);
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

enum ParentEvent {
    /// A result frame arrived; the flag records whether the child still
    /// needs reaping.
    Frame(Message, bool),
    /// The child died without delivering a frame.
    Died(String),
}

/// Parent side: wait for a result frame or child termination, whichever
/// happens first; always reap the child.
fn run_parent<S, E>(
    endpoint: &mut Endpoint,
    child: Pid,
    budget: Duration,
    on_success: S,
    on_error: E,
) -> Result<bool>
where
    S: FnOnce(&mut Message),
    E: FnOnce(String),
{
    let deadline = Instant::now() + budget;

    let event = loop {
        if let Some(message) = endpoint.poll_or_accept(PARENT_POLL)? {
            break ParentEvent::Frame(message, true);
        }

        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                // The frame may have been in flight when the child exited.
                if let Some(message) = endpoint.poll_or_accept(FINAL_DRAIN)? {
                    break ParentEvent::Frame(message, false);
                }
                break ParentEvent::Died(format!(
                    "Terminated unexpectedly with exit code {}",
                    code
                ));
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                if let Some(message) = endpoint.poll_or_accept(FINAL_DRAIN)? {
                    break ParentEvent::Frame(message, false);
                }
                break ParentEvent::Died(format!("Terminated unexpectedly by signal {}", sig));
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => break ParentEvent::Died("Terminated unexpectedly".to_string()),
            Err(e) => return Err(RigError::Process(format!("waitpid(sandbox): {}", e))),
        }

        if Instant::now() >= deadline {
            log::debug!("sandbox child {} exceeded budget, killing", child);
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            return Ok(false);
        }
    };

    match event {
        ParentEvent::Frame(mut message, reap) => {
            dispatch(
                message.get::<SandboxCode>(),
                &mut message,
                on_success,
                on_error,
            );
            if reap {
                let _ = waitpid(child, None);
            }
            Ok(true)
        }
        ParentEvent::Died(reason) => {
            on_error(reason);
            Ok(true)
        }
    }
}

fn dispatch<S, E>(
    code: Result<SandboxCode>,
    message: &mut Message,
    on_success: S,
    on_error: E,
) where
    S: FnOnce(&mut Message),
    E: FnOnce(String),
{
    match code {
        Ok(SandboxCode::Complete) => on_success(message),
        Ok(SandboxCode::Error) => {
            let reason = message
                .get::<String>()
                .unwrap_or_else(|_| "malformed error frame".to_string());
            on_error(reason);
        }
        Err(e) => on_error(format!("malformed result frame: {}", e)),
    }
}

/// Debugging path: same contract, no process boundary. The result still
/// round-trips through a message so both sides exercise the agreed field
/// order.
fn run_inline<B, C, S, E>(body: B, on_complete: C, on_success: S, on_error: E) -> Result<bool>
where
    B: FnOnce(),
    C: FnOnce(&mut Message),
    S: FnOnce(&mut Message),
    E: FnOnce(String),
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        enter();
        body();
        exit();
    }));

    match outcome {
        Ok(()) => {
            let mut message = Message::new();
            message.put(&SandboxCode::Complete);
            on_complete(&mut message);
            match message.get::<SandboxCode>() {
                Ok(SandboxCode::Complete) => on_success(&mut message),
                Ok(SandboxCode::Error) | Err(_) => {
                    on_error("malformed result frame".to_string())
                }
            }
        }
        Err(payload) => {
            if let Some(abort) = payload.downcast_ref::<SandboxAbort>() {
                on_error(abort.reason.clone());
            } else {
                monitor::force_disable();
                on_error(format!(
                    "Detected uncaught panic: {}",
                    panic_text(payload.as_ref())
                ));
            }
        }
    }
    Ok(true)
}
