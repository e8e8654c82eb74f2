//! # Call Contexts
//!
//! A context is one asynchronous execution lane bound to a worker thread on
//! the device. Requests submitted to it are executed strictly in submission
//! order by a single lane task; different contexts run independently.
//!
//! ## State machine
//!
//! ```text
//! RUNNING ⇄ IN_SYSCALL      (syscall relayed to the host mid-call)
//! RUNNING ⇄ BLOCKED         (worker reports the lane descheduled)
//! any     → EXITED          (close, termination, channel loss or worker report; terminal)
//! ```
//!
//! The state is the best-known status of the remote lane. Callers observe it
//! with [`Context::state`] or refresh it with [`Context::refresh_state`], but
//! never drive it.
//!
//! ## Close semantics
//!
//! Closing a context drains it: dispatch is refused from that point on, every
//! request already submitted runs to completion in order, and its result stays
//! retrievable exactly once. Process termination invalidates instead: pending
//! records are dropped and any retrieval yields `InvalidRequest`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::args::ArgsImage;
use crate::args::CallArgs;
use crate::buffer::HostBuffer;
use crate::channel::Channel;
use crate::error::CloseError;
use crate::error::DispatchError;
use crate::error::Error;
use crate::error::Result;
use crate::frame::Command;
use crate::frame::Notice;
use crate::frame::Response;
use crate::handles::ContextId;
use crate::handles::LaneId;
use crate::handles::LibraryHandle;
use crate::handles::RequestId;
use crate::request::Outcome;
use crate::request::RequestTable;
use crate::space::AddressSpace;
use crate::syscall::SyscallHandler;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ContextState {
    /// Idle or executing device code.
    Running,
    /// Relaying a system call to the host.
    InSyscall,
    /// Descheduled on the device.
    Blocked,
    /// Terminal; no further dispatch is accepted.
    Exited,
}

pub(crate) type Registry = DashMap<ContextId, Context>;

/// Everything a context needs from its process.
pub(crate) struct Wiring {
    pub channel: Arc<Channel>,
    pub space: Arc<AddressSpace>,
    pub syscalls: Arc<dyn SyscallHandler>,
    pub registry: Weak<Registry>,
}

/// A handle to one lane. Cheap to clone; all clones share the lane.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    id: ContextId,
    lane: LaneId,
    main: bool,
    wiring: Wiring,
    requests: RequestTable,
    state: watch::Sender<ContextState>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Job {
    id: RequestId,
    op: Op,
}

enum Op {
    Call { addr: u64, args: ArgsImage },
    Read { dst: HostBuffer, src: u64, len: u64 },
    Write { dst: u64, data: Vec<u8> },
}

impl Context {
    /// Binds a context to a lane the worker has already opened and starts its lane task.
    pub(crate) fn start(id: ContextId, lane: LaneId, main: bool, wiring: Wiring) -> Self {
        let notices = wiring.channel.register_lane(lane);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ContextState::Running);

        let inner = Arc::new(Inner {
            id,
            lane,
            main,
            wiring,
            requests: RequestTable::new(),
            state,
            queue: Mutex::new(Some(queue_tx)),
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(Inner::run(inner.clone(), queue_rx, notices));
        *lock(&inner.worker) = Some(worker);

        tracing::debug!(%id, %lane, main, "context started");
        Self { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn lane(&self) -> LaneId {
        self.inner.lane
    }

    /// Whether this is the process' main context, which cannot be closed.
    pub fn is_main(&self) -> bool {
        self.inner.main
    }

    /// Best-known state of the lane.
    pub fn state(&self) -> ContextState {
        *self.inner.state.borrow()
    }

    /// Number of submitted requests that have not finished yet.
    pub fn pending(&self) -> usize {
        self.inner.requests.pending()
    }

    /// Asks the worker for the lane's current state and updates the snapshot.
    pub async fn refresh_state(&self) -> Result<ContextState> {
        if self.state() == ContextState::Exited {
            return Ok(ContextState::Exited);
        }

        let channel = &self.inner.wiring.channel;
        let state = match channel.request(Some(self.inner.lane), Command::QueryState).await? {
            Ok(payload) => payload.state()?,
            Err(fault) => return Err(Error::Protocol(format!("state query refused: {}", fault))),
        };
        self.inner.set_state(state);
        Ok(self.state())
    }

    /// Enqueues a call to `addr` and returns immediately.
    pub fn call_async(&self, addr: u64, args: &CallArgs) -> Result<RequestId> {
        if addr == 0 {
            return Err(DispatchError::NullTarget.into());
        }
        let args = args.snapshot().map_err(DispatchError::Args)?;
        self.submit(Op::Call { addr, args })
    }

    /// Resolves `symbol` in `library` through the owning process, then enqueues the call.
    pub async fn call_async_by_name(
        &self,
        library: LibraryHandle,
        symbol: &str,
        args: &CallArgs,
    ) -> Result<RequestId> {
        if self.state() == ContextState::Exited {
            return Err(DispatchError::Exited.into());
        }
        let addr = self.inner.wiring.space.resolve_symbol(library, symbol).await?;
        self.call_async(addr, args)
    }

    /// Enqueues a read of `size` bytes at `src` into `dst`.
    pub fn async_read_mem(&self, dst: &HostBuffer, src: u64, size: usize) -> Result<RequestId> {
        let len = size as u64;
        if dst.len() < size {
            return Err(Error::Transfer {
                addr: src,
                len,
                reason: format!("host buffer holds only {} bytes", dst.len()),
                code: libc::EINVAL,
            });
        }
        self.inner.wiring.space.check_range(src, len)?;
        self.submit(Op::Read { dst: dst.clone(), src, len })
    }

    /// Enqueues a write of `src` to `dst`. The bytes are copied before returning.
    pub fn async_write_mem(&self, dst: u64, src: &[u8]) -> Result<RequestId> {
        self.inner.wiring.space.check_range(dst, src.len() as u64)?;
        self.submit(Op::Write { dst, data: src.to_vec() })
    }

    /// Returns the result if the request has finished, `None` otherwise. Never blocks.
    pub fn peek_result(&self, id: RequestId) -> Result<Option<Outcome>> {
        self.inner.requests.peek(id)
    }

    /// Waits until the request finishes or the context exits.
    pub async fn wait_result(&self, id: RequestId) -> Result<Outcome> {
        let Some(mut done) = self.inner.requests.subscribe(id) else {
            return Err(Error::InvalidRequest(id));
        };
        let mut state = self.inner.state.subscribe();

        let exited = tokio::select! {
            _ = done.wait_for(Option::is_some) => false,
            _ = state.wait_for(|s| *s == ContextState::Exited) => true,
        };

        match self.inner.requests.take(id) {
            Err(e) if exited => {
                self.inner.requests.cancel(id);
                Err(e)
            }
            taken => taken,
        }
    }

    /// Stops the lane after draining every request already submitted.
    ///
    /// Closing the main context is always refused and leaves it untouched.
    /// Closing an already exited context is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.main {
            tracing::error!(id = %self.inner.id, "refusing to close the main context");
            return Err(CloseError::MainContext.into());
        }

        // dropping the sender lets the lane task finish the queue and return
        if lock(&self.inner.queue).take().is_none() {
            self.inner.forget();
            return Ok(());
        }

        let worker = lock(&self.inner.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                self.inner.retire();
                self.inner.forget();
                return Err(CloseError::Lane(e.to_string()).into());
            }
        }

        let channel = &self.inner.wiring.channel;
        let status = channel.request(Some(self.inner.lane), Command::CloseLane).await;
        self.inner.exit();
        self.inner.forget();

        match status {
            Ok(Ok(_)) => {
                tracing::debug!(id = %self.inner.id, "context closed");
                Ok(())
            }
            Ok(Err(fault)) => Err(CloseError::Lane(fault.to_string()).into()),
            Err(Error::ProcessNotAvailable) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tears the lane down without draining. Used by process termination.
    pub(crate) fn invalidate(&self) {
        if let Some(worker) = lock(&self.inner.worker).take() {
            worker.abort();
        }
        self.inner.retire();
    }

    fn submit(&self, op: Op) -> Result<RequestId> {
        let queue = lock(&self.inner.queue);
        let Some(tx) = queue.as_ref() else {
            return Err(DispatchError::Exited.into());
        };
        if self.state() == ContextState::Exited {
            return Err(DispatchError::Exited.into());
        }

        let id = self.inner.requests.register();
        if tx.send(Job { id, op }).is_err() {
            self.inner.requests.cancel(id);
            return Err(DispatchError::Exited.into());
        }
        tracing::trace!(ctx = %self.inner.id, %id, "request queued");
        Ok(id)
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        mut jobs: mpsc::UnboundedReceiver<Job>,
        mut notices: mpsc::UnboundedReceiver<Notice>,
    ) {
        while !self.exited() {
            tokio::select! {
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    if let Err(e) = self.execute(job, &mut notices).await {
                        tracing::warn!(ctx = %self.id, error = %e, "lane lost its channel");
                        self.retire();
                        break;
                    }
                }
                notice = notices.recv() => match notice {
                    Some(notice) => self.apply(notice).await,
                    // the channel dropped every lane route
                    None => {
                        if !self.exited() {
                            tracing::warn!(ctx = %self.id, "lane lost its channel");
                        }
                        self.retire();
                        break;
                    }
                },
            }
        }
    }

    /// Runs one job to completion, servicing notices while it is in flight.
    async fn execute(&self, job: Job, notices: &mut mpsc::UnboundedReceiver<Notice>) -> Result<()> {
        let (command, sink) = match job.op {
            Op::Call { addr, args } => (Command::Call { addr, args }, Sink::Call),
            Op::Read { dst, src, len } => (Command::Read { addr: src, len }, Sink::Read(dst)),
            Op::Write { dst, data } => (Command::Write { addr: dst, data }, Sink::Write),
        };

        let reply = self.wiring.channel.request(Some(self.lane), command);
        let lane_exit = exit_signal(self.state.subscribe());
        tokio::pin!(reply);
        tokio::pin!(lane_exit);

        let response = loop {
            tokio::select! {
                response = &mut reply => break response,
                _ = &mut lane_exit => {
                    tracing::debug!(ctx = %self.id, id = %job.id, "lane exited mid-request");
                    return Ok(());
                }
                Some(notice) = notices.recv() => self.apply(notice).await,
            }
        };

        let outcome = sink.finish(response?);
        tracing::debug!(ctx = %self.id, id = %job.id, ?outcome, "request finished");
        self.requests.complete(job.id, outcome);
        Ok(())
    }

    async fn apply(&self, notice: Notice) {
        match notice {
            Notice::State(state) => self.set_state(state),
            Notice::Syscall { token, nr, args } => {
                self.set_state(ContextState::InSyscall);
                let value = self.wiring.syscalls.handle(self.lane, nr, &args);
                let command = Command::SyscallReturn { token, value };
                match self.wiring.channel.request(Some(self.lane), command).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(fault)) => tracing::warn!(lane = %self.lane, nr, %fault, "syscall return refused"),
                    Err(e) => tracing::warn!(lane = %self.lane, nr, error = %e, "syscall return lost"),
                }
                self.set_state(ContextState::Running);
            }
        }
    }

    /// Updates the snapshot unless the lane has already exited.
    ///
    /// An exit reported by the worker tears the lane down like invalidation.
    fn set_state(&self, state: ContextState) {
        if state == ContextState::Exited {
            if !self.exited() {
                tracing::debug!(ctx = %self.id, "worker reports the lane exited");
                self.retire();
            }
            return;
        }
        self.state.send_if_modified(|current| {
            if *current == ContextState::Exited || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn exited(&self) -> bool {
        *self.state.borrow() == ContextState::Exited
    }

    fn exit(&self) {
        self.state.send_replace(ContextState::Exited);
        self.wiring.channel.unregister_lane(self.lane);
    }

    /// Exits without draining: dispatch stops and every record is dropped.
    fn retire(&self) {
        lock(&self.queue).take();
        self.exit();
        let dropped = self.requests.invalidate_all();
        if dropped > 0 {
            tracing::debug!(id = %self.id, dropped, "pending requests invalidated");
        }
    }

    /// Removes the context from its process' registry.
    fn forget(&self) {
        if let Some(registry) = self.wiring.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

/// Where a finished job's reply goes.
enum Sink {
    Call,
    Read(HostBuffer),
    Write,
}

impl Sink {
    fn finish(self, response: Response) -> Outcome {
        let payload = match response {
            Ok(payload) => payload,
            Err(fault) => {
                tracing::debug!(%fault, "request failed on the worker");
                return Outcome::Error;
            }
        };

        let result = match self {
            Sink::Call => payload.completed(),
            Sink::Read(dst) => payload.bytes().and_then(|bytes| {
                if dst.fill_from(&bytes) {
                    Ok(Outcome::Ready(0))
                } else {
                    Err(Error::Protocol(format!("read returned {} bytes, buffer holds {}", bytes.len(), dst.len())))
                }
            }),
            Sink::Write => payload.unit().map(|_| Outcome::Ready(0)),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "malformed reply");
            Outcome::Error
        })
    }
}

/// Resolves once the lane is exited.
async fn exit_signal(mut state: watch::Receiver<ContextState>) {
    let _ = state.wait_for(|s| *s == ContextState::Exited).await;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
