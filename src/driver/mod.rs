//! Driver-side orchestration: worker pool ownership, distributed dispatch,
//! result aggregation, and the quorum notify/wait primitive.

pub mod scheduler;

use crate::config::SuiteConfig;
use crate::context::{self, Role};
use crate::monitor::{lock_unpoisoned, ReentrancyGuard};
use crate::suite::exec;
use crate::suite::record::TestRecord;
use crate::transport::message::{Message, OpCode};
use crate::transport::socket::{Connection, Endpoint};
use crate::types::{Result, RigError, Status};
use crate::worker;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cadence of the driver's event loop.
const EVENT_POLL: Duration = Duration::from_millis(50);

/// A forked worker must report started within this window.
const START_DEADLINE: Duration = Duration::from_secs(30);

/// State of one pooled worker process.
///
/// Owned exclusively by the driver context; mutated only by the driver's
/// event-processing loop.
pub(crate) struct WorkerHandle {
    id: u32,
    pid: Pid,
    address: Option<SocketAddr>,
    conn: Option<Connection>,
    running: bool,
    done: bool,
    status: Status,
    report: String,
    notify_count: u32,
}

impl WorkerHandle {
    fn new(id: u32, pid: Pid) -> Self {
        Self {
            id,
            pid,
            address: None,
            conn: None,
            running: false,
            done: false,
            status: Status::Pending,
            report: String::new(),
            notify_count: 0,
        }
    }
}

pub(crate) struct DriverContext {
    endpoint: Endpoint,
    workers: BTreeMap<u32, WorkerHandle>,
    allocated: BTreeSet<u32>,
    default_workers: u16,
}

static DRIVER: Mutex<Option<DriverContext>> = Mutex::new(None);

/// Create the driver context and claim the driver role for this process.
/// Replaces (and shuts down) any previous context.
pub(crate) fn start(config: &SuiteConfig) -> Result<()> {
    let endpoint = Endpoint::bind()?;
    log::debug!("driver listening on {}", endpoint.address()?);
    let ctx = DriverContext {
        endpoint,
        workers: BTreeMap::new(),
        allocated: BTreeSet::new(),
        default_workers: config.default_workers.max(1),
    };
    *lock_unpoisoned(&DRIVER) = Some(ctx);
    context::set_role(Role::Driver);
    Ok(())
}

/// Tear down the context, terminating the persistent pool.
pub(crate) fn shutdown() {
    *lock_unpoisoned(&DRIVER) = None;
}

fn with<R>(f: impl FnOnce(&mut DriverContext) -> Result<R>) -> Result<R> {
    let mut guard = lock_unpoisoned(&DRIVER);
    match guard.as_mut() {
        Some(ctx) => f(ctx),
        None => Err(RigError::Process("driver context not started".to_string())),
    }
}

/// Broadcast a notify signal to all allocated workers.
pub(crate) fn notify() -> Result<()> {
    with(|ctx| ctx.notify())
}

/// Block until the quorum condition holds; see [`DriverContext::wait`].
pub(crate) fn wait(n: u32) -> Result<()> {
    with(|ctx| ctx.wait(n))
}

/// Full lifecycle of one distributed test: allocate, dispatch, run the
/// driver body, join, release.
///
/// The driver body runs in-process so its notify/wait calls operate on the
/// live worker pool; the driver's context lock is never held across it.
pub(crate) fn run_distributed(record: &mut TestRecord) -> Result<()> {
    let requested = if record.options.workers == 0 {
        with(|ctx| Ok(ctx.default_workers))?
    } else {
        record.options.workers
    };

    let spawned = with(|ctx| ctx.allocate_workers(requested))?;
    with(|ctx| ctx.dispatch(record.module(), record.name()))?;

    exec::execute(record, false, true)?;

    with(|ctx| ctx.join(record))?;
    with(|ctx| ctx.deallocate_workers(&spawned))
}

impl DriverContext {
    fn next_worker_id(&self) -> u32 {
        self.workers
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0)
    }

    /// Fork a new worker process. The child never returns from this call.
    fn spawn_worker(&mut self) -> Result<u32> {
        let id = self.next_worker_id();
        let driver_address = self.endpoint.address()?;

        match unsafe { fork() }.map_err(|e| RigError::Process(format!("fork(worker): {}", e)))? {
            ForkResult::Child => worker::run_worker(id, driver_address),
            ForkResult::Parent { child } => {
                log::debug!("spawned worker {} as pid {}", id, child);
                self.workers.insert(id, WorkerHandle::new(id, child));
                Ok(id)
            }
        }
    }

    /// Process one inbound event, returning the id of the worker it came
    /// from. Malformed frames, unknown opcodes, and unknown worker ids are
    /// ignored defensively.
    fn process_event(&mut self, timeout: Duration) -> Result<Option<u32>> {
        let Some(mut message) = self.endpoint.poll_or_accept(timeout)? else {
            return Ok(None);
        };

        let decoded = (|| -> Result<Option<u32>> {
            let op = message.get::<OpCode>()?;
            match op {
                OpCode::WorkerStarted => {
                    let id = message.get::<u32>()?;
                    let address = message.get::<String>()?;
                    let Some(handle) = self.workers.get_mut(&id) else {
                        log::warn!("driver: started report from unknown worker {}", id);
                        return Ok(None);
                    };
                    handle.address = Some(address.parse().map_err(|e| {
                        RigError::Protocol(format!("bad worker address {}: {}", address, e))
                    })?);
                    handle.running = true;
                    log::debug!("worker {} started at {}", id, address);
                    Ok(Some(id))
                }
                OpCode::FinishedTest => {
                    let id = message.get::<u32>()?;
                    let status = message.get::<Status>()?;
                    let report = message.get::<String>()?;
                    if !self.allocated.contains(&id) {
                        log::warn!("driver: finished report from unallocated worker {}", id);
                        return Ok(None);
                    }
                    if let Some(handle) = self.workers.get_mut(&id) {
                        handle.done = true;
                        handle.status = status;
                        handle.report = report;
                    }
                    Ok(Some(id))
                }
                OpCode::Notify => {
                    let id = message.get::<u32>()?;
                    if !self.allocated.contains(&id) {
                        log::warn!("driver: notify from unallocated worker {}", id);
                        return Ok(None);
                    }
                    if let Some(handle) = self.workers.get_mut(&id) {
                        handle.notify_count += 1;
                    }
                    Ok(Some(id))
                }
                other => {
                    log::warn!("driver: unexpected opcode {:?}", other);
                    Ok(None)
                }
            }
        })();

        match decoded {
            Ok(id) => Ok(id),
            Err(e) => {
                log::warn!("driver: malformed event ignored: {}", e);
                Ok(None)
            }
        }
    }

    /// Grow the pool to at least `n` workers, block until the first `n`
    /// have reported started, reset their allocation state, and mark them
    /// allocated. Returns the ids spawned beyond the pre-existing pool.
    fn allocate_workers(&mut self, n: u16) -> Result<Vec<u32>> {
        let mut spawned = Vec::new();
        while self.workers.len() < n as usize {
            spawned.push(self.spawn_worker()?);
        }

        let ids: Vec<u32> = self.workers.keys().copied().take(n as usize).collect();
        for id in ids {
            let deadline = Instant::now() + START_DEADLINE;
            loop {
                let handle = self
                    .workers
                    .get(&id)
                    .ok_or_else(|| RigError::Process(format!("worker {} disappeared", id)))?;
                if handle.running {
                    break;
                }
                if self.worker_died(id)? {
                    self.workers.remove(&id);
                    return Err(RigError::Process(format!(
                        "worker {} terminated during startup",
                        id
                    )));
                }
                if Instant::now() >= deadline {
                    return Err(RigError::Process(format!(
                        "worker {} did not report started in time",
                        id
                    )));
                }
                self.process_event(EVENT_POLL)?;
            }

            let handle = self
                .workers
                .get_mut(&id)
                .ok_or_else(|| RigError::Process(format!("worker {} disappeared", id)))?;
            handle.notify_count = 0;
            handle.done = false;
            handle.status = Status::Pending;
            handle.report.clear();
            if handle.conn.is_none() {
                let address = handle.address.ok_or_else(|| {
                    RigError::Process(format!("worker {} has no address", id))
                })?;
                handle.conn = Some(Connection::connect(address)?);
            }
            self.allocated.insert(id);
        }

        Ok(spawned)
    }

    /// Terminate and reap only the workers spawned for this allocation;
    /// the baseline pool persists for reuse.
    fn deallocate_workers(&mut self, spawned: &[u32]) -> Result<()> {
        for id in spawned {
            if let Some(mut handle) = self.workers.remove(id) {
                let _guard = ReentrancyGuard::enter();
                let mut message = Message::new();
                message.put(&OpCode::Terminate);
                if let Some(conn) = handle.conn.as_mut() {
                    let _ = conn.send(&message);
                }
                let _ = waitpid(handle.pid, None);
                log::debug!("deallocated worker {}", id);
            }
        }
        self.allocated.clear();
        Ok(())
    }

    /// Send a run-request for `(module, name)` to every allocated worker.
    fn dispatch(&mut self, module: &str, name: &str) -> Result<()> {
        let _guard = ReentrancyGuard::enter();
        let mut message = Message::new();
        message
            .put(&OpCode::RunTest)
            .put(&module.to_string())
            .put(&name.to_string());

        for id in self.allocated.clone() {
            if let Some(handle) = self.workers.get_mut(&id) {
                if let Some(conn) = handle.conn.as_mut() {
                    conn.send(&message)?;
                }
            }
        }
        Ok(())
    }

    /// Block until every allocated worker reports completion, appending
    /// each worker's status and report in worker-id order regardless of
    /// completion order.
    fn join(&mut self, record: &mut TestRecord) -> Result<()> {
        for id in self.allocated.clone() {
            loop {
                let Some(handle) = self.workers.get(&id) else {
                    record.child_status.push(Status::Fail);
                    record
                        .child_reports
                        .push("worker terminated unexpectedly".to_string());
                    break;
                };
                if handle.done {
                    record.child_status.push(handle.status);
                    record.child_reports.push(handle.report.clone());
                    break;
                }
                if self.worker_died(id)? {
                    log::warn!("driver: worker {} died before finishing", id);
                    self.workers.remove(&id);
                    record.child_status.push(Status::Fail);
                    record
                        .child_reports
                        .push("worker terminated unexpectedly".to_string());
                    break;
                }
                self.process_event(EVENT_POLL)?;
            }
        }
        Ok(())
    }

    /// Broadcast a notify signal to all allocated workers.
    fn notify(&mut self) -> Result<()> {
        let _guard = ReentrancyGuard::enter();
        let mut message = Message::new();
        message.put(&OpCode::Notify);

        for id in self.allocated.clone() {
            if let Some(handle) = self.workers.get_mut(&id) {
                if let Some(conn) = handle.conn.as_mut() {
                    conn.send(&message)?;
                }
            }
        }
        Ok(())
    }

    /// Block until at least `n` distinct allocated workers each hold one or
    /// more pending notifications, consuming exactly one per satisfied
    /// worker. A worker that notified twice before others caught up still
    /// counts once; its extra notification stays pending.
    fn wait(&mut self, n: u32) -> Result<()> {
        let _guard = ReentrancyGuard::enter();
        let n = if n == context::WAIT_ALL {
            self.allocated.len() as u32
        } else {
            n
        };

        let mut pulled: BTreeSet<u32> = BTreeSet::new();
        for id in self.allocated.clone() {
            if pulled.len() as u32 == n {
                return Ok(());
            }
            pull_notification(&mut self.workers, &mut pulled, id);
        }

        while (pulled.len() as u32) < n {
            let Some(id) = self.process_event(EVENT_POLL)? else {
                continue;
            };
            if self.allocated.contains(&id) {
                pull_notification(&mut self.workers, &mut pulled, id);
            }
        }
        Ok(())
    }

    /// Non-blocking liveness probe; also reaps if the worker exited.
    fn worker_died(&self, id: u32) -> Result<bool> {
        let Some(handle) = self.workers.get(&id) else {
            return Ok(true);
        };
        match waitpid(handle.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(false),
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => Ok(true),
            Ok(_) => Ok(false),
            Err(Errno::ECHILD) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(RigError::Process(format!("waitpid(worker {}): {}", id, e))),
        }
    }
}

/// Consume one pending notification from `id` if it has any and has not
/// already been credited toward the current quorum.
fn pull_notification(
    workers: &mut BTreeMap<u32, WorkerHandle>,
    pulled: &mut BTreeSet<u32>,
    id: u32,
) {
    if pulled.contains(&id) {
        return;
    }
    if let Some(handle) = workers.get_mut(&id) {
        if handle.notify_count > 0 {
            handle.notify_count -= 1;
            pulled.insert(handle.id);
        }
    }
}

impl Drop for DriverContext {
    fn drop(&mut self) {
        let _guard = ReentrancyGuard::enter();
        let mut message = Message::new();
        message.put(&OpCode::Terminate);
        for handle in self.workers.values_mut() {
            if let Some(conn) = handle.conn.as_mut() {
                let _ = conn.send(&message);
            }
        }
        for handle in self.workers.values() {
            let _ = waitpid(handle.pid, None);
        }
    }
}
