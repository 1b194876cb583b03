//! Worker-side event loop.
//!
//! A worker is a forked process bound to a stable id. It binds its own
//! endpoint, reports started to the driver, then serves run-requests until
//! told to terminate. Dispatched tests execute inside the worker's own
//! sandbox; the worker reports status and report text back over its
//! persistent driver connection.

use crate::context::{self, Role};
use crate::monitor::{lock_unpoisoned, ReentrancyGuard};
use crate::registry;
use crate::suite::exec;
use crate::transport::message::{Message, OpCode};
use crate::transport::socket::{Connection, Endpoint};
use crate::types::{Result, RigError, Status};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

/// Cadence of the worker's event loop.
const EVENT_POLL: Duration = Duration::from_millis(50);

struct WorkerContext {
    id: u32,
    endpoint: Endpoint,
    driver: Connection,
    notify_count: u32,
    in_test: bool,
}

static WORKER: Mutex<Option<WorkerContext>> = Mutex::new(None);

fn with<R>(f: impl FnOnce(&mut WorkerContext) -> Result<R>) -> Result<R> {
    let mut guard = lock_unpoisoned(&WORKER);
    match guard.as_mut() {
        Some(ctx) => f(ctx),
        None => Err(RigError::Process("worker context not started".to_string())),
    }
}

/// Entry point of a forked worker process; never returns.
pub(crate) fn run_worker(id: u32, driver_address: SocketAddr) -> ! {
    let code = match worker_main(id, driver_address) {
        Ok(()) => 0,
        Err(e) => {
            log::warn!("worker {} failed: {}", id, e);
            1
        }
    };
    std::process::exit(code)
}

fn worker_main(id: u32, driver_address: SocketAddr) -> Result<()> {
    context::set_role(Role::Worker);

    let endpoint = Endpoint::bind()?;
    let address = endpoint.address()?;
    let mut driver = Connection::connect(driver_address)?;

    {
        let _guard = ReentrancyGuard::enter();
        let mut message = Message::new();
        message
            .put(&OpCode::WorkerStarted)
            .put(&id)
            .put(&address.to_string());
        driver.send(&message)?;
    }
    log::debug!("worker {} listening on {}", id, address);

    *lock_unpoisoned(&WORKER) = Some(WorkerContext {
        id,
        endpoint,
        driver,
        notify_count: 0,
        in_test: false,
    });

    loop {
        step()?;
    }
}

/// One event-loop turn. Terminate exits the process from inside.
fn step() -> Result<()> {
    let polled = with(|ctx| ctx.endpoint.poll_or_accept(EVENT_POLL))?;
    let Some(mut message) = polled else {
        return Ok(());
    };

    match message.get::<OpCode>() {
        Ok(OpCode::RunTest) => {
            match (message.get::<String>(), message.get::<String>()) {
                (Ok(module), Ok(name)) => handle_run(&module, &name),
                _ => {
                    log::warn!("worker: malformed run request ignored");
                    Ok(())
                }
            }
        }
        Ok(OpCode::Notify) => with(|ctx| {
            ctx.notify_count += 1;
            Ok(())
        }),
        Ok(OpCode::Terminate) => {
            log::debug!("worker terminating on request");
            std::process::exit(0);
        }
        Ok(other) => {
            log::warn!("worker: unexpected opcode {:?}", other);
            Ok(())
        }
        Err(e) => {
            log::warn!("worker: malformed frame ignored: {}", e);
            Ok(())
        }
    }
}

/// Execute a dispatched test and report its result. Re-entrant run
/// requests are refused; the context lock is not held across execution so
/// the body's own notify/wait calls stay live.
fn handle_run(module: &str, name: &str) -> Result<()> {
    let refused = with(|ctx| {
        if ctx.in_test {
            log::warn!("worker {}: refusing re-entrant run request", ctx.id);
            return Ok(true);
        }
        ctx.in_test = true;
        Ok(false)
    })?;
    if refused {
        return Ok(());
    }

    let (status, report) = match registry::lookup(module, name) {
        Some(mut record) => match exec::execute(&mut record, true, false) {
            Ok(()) => (record.status(), record.report().to_string()),
            Err(e) => (Status::Fail, format!("worker execution error: {}", e)),
        },
        None => {
            log::warn!("worker: test {}::{} not in registry", module, name);
            (
                Status::Fail,
                format!("test {}::{} not found in worker registry", module, name),
            )
        }
    };

    with(|ctx| {
        let _guard = ReentrancyGuard::enter();
        let mut message = Message::new();
        message
            .put(&OpCode::FinishedTest)
            .put(&ctx.id)
            .put(&status)
            .put(&report);
        let sent = ctx.driver.send(&message);
        ctx.in_test = false;
        sent
    })
}

/// Send a notify signal to the driver.
pub(crate) fn notify() -> Result<()> {
    let _guard = ReentrancyGuard::enter();
    with(|ctx| {
        let mut message = Message::new();
        message.put(&OpCode::Notify).put(&ctx.id);
        ctx.driver.send(&message)
    })
}

/// Block until the local notify counter reaches `n`, then consume `n`.
/// [`context::WAIT_ALL`] defaults to a single notification.
pub(crate) fn wait(n: u32) -> Result<()> {
    let n = if n == context::WAIT_ALL { 1 } else { n };
    let _guard = ReentrancyGuard::enter();

    loop {
        let satisfied = with(|ctx| {
            if ctx.notify_count >= n {
                ctx.notify_count -= n;
                return Ok(true);
            }
            if let Some(mut message) = ctx.endpoint.poll_or_accept(EVENT_POLL)? {
                match message.get::<OpCode>() {
                    Ok(OpCode::Notify) => ctx.notify_count += 1,
                    Ok(OpCode::Terminate) => std::process::exit(0),
                    Ok(other) => log::warn!("worker: unexpected opcode {:?} during wait", other),
                    Err(e) => log::warn!("worker: malformed frame ignored: {}", e),
                }
            }
            Ok(false)
        })?;
        if satisfied {
            return Ok(());
        }
    }
}

pub(crate) fn id() -> Option<u32> {
    lock_unpoisoned(&WORKER).as_ref().map(|ctx| ctx.id)
}
