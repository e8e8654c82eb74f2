//! # Mock Device
//!
//! An in-process stand-in for a worker running on a vector device, used by
//! the test suites of this workspace and of downstream crates.
//!
//! Each launch spawns a worker task connected through an mpsc duplex. The
//! worker answers control commands inline and runs every lane on its own task,
//! so lane work executes in arrival order while `QueryState`, `CloseLane` and
//! `SyscallReturn` are answered out of band.
//!
//! Device code is modelled by *kernels*: async closures registered under a
//! symbol name in a [`MockLibrary`]. A kernel receives a [`KernelCall`] through
//! which it can read its arguments, touch remote memory, relay a syscall to the
//! host or report a scheduling state.
//!
//! The allocator is a bump allocator and never hands out an address twice.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::args::ArgWord;
use crate::args::ArgsImage;
use crate::context::ContextState;
use crate::frame::Command;
use crate::frame::Fault;
use crate::frame::Inbound;
use crate::frame::Notice;
use crate::frame::Payload;
use crate::frame::Reply;
use crate::frame::Request;
use crate::frame::Response;
use crate::handles::LaneId;
use crate::request::Outcome;
use crate::transport;
use crate::transport::Launcher;
use crate::transport::Transport;
use crate::transport::WorkerConfig;

const HEAP_BASE: u64 = 0x6000_0000;
const HEAP_ALIGN: u64 = 64;
const CODE_BASE: u64 = 0x4000_0000;
const STACK_BASE: u64 = 0x7f00_0000_0000;
const STACK_STRIDE: u64 = 0x1_0000_0000;
/// Largest single allocation a mock worker serves.
const MAX_REGION: u64 = 1 << 32;

/// Device code: an async function from a call to its outcome.
pub type Kernel = Arc<dyn Fn(KernelCall) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// A library the mock loader knows about.
#[derive(Clone)]
pub struct MockLibrary {
    path: String,
    functions: Vec<(String, Kernel)>,
}

impl MockLibrary {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), functions: Vec::new() }
    }

    /// Exports `name`, backed by the given async kernel.
    pub fn function<F, Fut>(mut self, name: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(KernelCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let kernel: Kernel = Arc::new(move |call| kernel(call).boxed());
        self.functions.push((name.into(), kernel));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A simulated device. Every launch gets a fresh worker with its own memory.
#[derive(Clone)]
pub struct MockDevice {
    shared: Arc<DeviceShared>,
}

struct DeviceShared {
    libraries: DashMap<String, MockLibrary>,
    reject: AtomicBool,
    memory_limit: AtomicU64,
    lane_limit: AtomicU64,
    launches: AtomicU64,
    exits: AtomicU64,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                libraries: DashMap::new(),
                reject: AtomicBool::new(false),
                memory_limit: AtomicU64::new(u64::MAX),
                lane_limit: AtomicU64::new(u64::MAX),
                launches: AtomicU64::new(0),
                exits: AtomicU64::new(0),
            }),
        }
    }

    /// Makes `library` loadable under its path.
    pub fn with_library(self, library: MockLibrary) -> Self {
        self.shared.libraries.insert(library.path.clone(), library);
        self
    }

    /// Caps the bytes each worker may have allocated at once.
    pub fn with_memory_limit(self, bytes: u64) -> Self {
        self.shared.memory_limit.store(bytes, Ordering::SeqCst);
        self
    }

    /// Caps the number of lanes (main included) each worker may have open.
    pub fn with_lane_limit(self, lanes: u64) -> Self {
        self.shared.lane_limit.store(lanes, Ordering::SeqCst);
        self
    }

    /// Makes subsequent launches fail as if the worker binary were missing.
    pub fn reject_launches(&self, reject: bool) {
        self.shared.reject.store(reject, Ordering::SeqCst);
    }

    /// Number of workers started so far.
    pub fn launches(&self) -> u64 {
        self.shared.launches.load(Ordering::SeqCst)
    }

    /// Number of workers that received an orderly `Exit`.
    pub fn exits(&self) -> u64 {
        self.shared.exits.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Launcher for MockDevice {
    async fn launch(&self, config: &WorkerConfig) -> transport::Result<Box<dyn Transport>> {
        if self.shared.reject.load(Ordering::SeqCst) {
            return Err(transport::Error::Rejected {
                code: libc::ENOENT,
                reason: format!("cannot start {}", config.worker_binary.display()),
            });
        }
        self.shared.launches.fetch_add(1, Ordering::SeqCst);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let worker = Worker::new(self.shared.clone(), inbound_tx);
        tokio::spawn(worker.run(request_rx));

        Ok(Box::new(MockTransport {
            tx: request_tx,
            rx: tokio::sync::Mutex::new(inbound_rx),
        }))
    }
}

/// Host end of the duplex to a mock worker.
struct MockTransport {
    tx: mpsc::UnboundedSender<Request>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: Request) -> transport::Result<()> {
        self.tx
            .send(request)
            .map_err(|_| transport::Error::ConnectionLost("worker is gone".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// Everything lane tasks and kernels share with the control loop.
struct Core {
    out: mpsc::UnboundedSender<Inbound>,
    memory: Mutex<Memory>,
    kernels: DashMap<u64, Kernel>,
    syscalls: DashMap<u64, oneshot::Sender<i64>>,
    next_token: AtomicU64,
}

impl Core {
    fn reply(&self, seq: u64, status: Response) {
        let _ = self.out.send(Inbound::Reply(Reply { seq, status }));
    }

    fn notify(&self, lane: LaneId, notice: Notice) {
        let _ = self.out.send(Inbound::Notice { lane, notice });
    }

    fn memory(&self) -> MutexGuard<'_, Memory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transfer(&self, command: Command) -> Response {
        match command {
            Command::Read { addr, len } => self.memory().read(addr, len).map(Payload::Bytes),
            Command::Write { addr, data } => self.memory().write(addr, &data).map(|_| Payload::Unit),
            other => Err(Fault::new(libc::EINVAL, format!("{} is not lane work", other.name()))),
        }
    }

    async fn call(self: &Arc<Self>, lane: LaneId, state: &LaneState, addr: u64, image: ArgsImage) -> Outcome {
        let kernel = self.kernels.get(&addr).map(|k| k.value().clone());
        let Some(kernel) = kernel else {
            tracing::debug!(%lane, addr, "call to unmapped address");
            return Outcome::Exception(libc::SIGSEGV as u64);
        };

        let stack_base = STACK_BASE + lane.0 * STACK_STRIDE;
        if !image.stack.is_empty() {
            self.memory().map(stack_base, image.stack.clone());
        }

        let call = KernelCall {
            lane,
            args: image.resolve(stack_base),
            stack_base,
            image,
            core: self.clone(),
            state: state.clone(),
        };
        let outcome = kernel(call).await;

        self.memory().unmap(stack_base);
        outcome
    }
}

type LaneState = Arc<Mutex<ContextState>>;

fn read_state(state: &LaneState) -> ContextState {
    *state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(state: &LaneState, value: ContextState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

/// The view a kernel gets of its invocation.
pub struct KernelCall {
    lane: LaneId,
    args: Vec<u64>,
    stack_base: u64,
    image: ArgsImage,
    core: Arc<Core>,
    state: LaneState,
}

impl KernelCall {
    pub fn lane(&self) -> LaneId {
        self.lane
    }

    /// Register words as the callee sees them. Stack arguments are pointers.
    pub fn args(&self) -> &[u64] {
        &self.args
    }

    /// Argument `index`, or zero past the end of the list.
    pub fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    pub fn stack_base(&self) -> u64 {
        self.stack_base
    }

    /// Bytes of the stack argument at `index`, if that argument is one.
    pub fn stack_bytes(&self, index: usize) -> Option<&[u8]> {
        match self.image.words.get(index)? {
            ArgWord::Stack { offset, len } => self.image.stack.get(*offset..*offset + *len),
            ArgWord::Value(_) => None,
        }
    }

    pub fn read(&self, addr: u64, len: u64) -> Result<Vec<u8>, Fault> {
        self.core.memory().read(addr, len)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), Fault> {
        self.core.memory().write(addr, data)
    }

    /// Relays syscall `nr` to the host and waits for its answer.
    pub async fn syscall(&self, nr: u64, args: &[u64]) -> i64 {
        let token = self.core.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.core.syscalls.insert(token, tx);

        write_state(&self.state, ContextState::InSyscall);
        self.core.notify(self.lane, Notice::Syscall { token, nr, args: args.to_vec() });
        let value = rx.await.unwrap_or(-(libc::EIO as i64));
        write_state(&self.state, ContextState::Running);
        value
    }

    /// Reports a scheduling change of the lane to the host.
    pub fn set_state(&self, state: ContextState) {
        write_state(&self.state, state);
        self.core.notify(self.lane, Notice::State(state));
    }
}

/// Remote memory of one worker.
struct Memory {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
    used: u64,
    limit: u64,
}

impl Memory {
    fn new(limit: u64) -> Self {
        Self { regions: BTreeMap::new(), next: HEAP_BASE, used: 0, limit }
    }

    fn alloc(&mut self, size: u64) -> Result<u64, Fault> {
        let out_of_memory = || Fault::new(libc::ENOMEM, format!("cannot allocate {} bytes", size));

        let used = self.used.saturating_add(size);
        if used > self.limit || size > MAX_REGION {
            return Err(out_of_memory());
        }
        let len = usize::try_from(size).map_err(|_| out_of_memory())?;

        // one guard granule between allocations
        let next = size
            .max(1)
            .checked_next_multiple_of(HEAP_ALIGN)
            .and_then(|span| span.checked_add(HEAP_ALIGN))
            .and_then(|span| self.next.checked_add(span))
            .filter(|next| *next <= STACK_BASE)
            .ok_or_else(out_of_memory)?;

        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|_| out_of_memory())?;
        bytes.resize(len, 0);

        let addr = self.next;
        self.next = next;
        self.used = used;
        self.regions.insert(addr, bytes);
        Ok(addr)
    }

    fn free(&mut self, addr: u64) -> Result<(), Fault> {
        if addr >= STACK_BASE {
            return Err(Fault::new(libc::EINVAL, format!("{:#x} is not a heap address", addr)));
        }
        let region = self
            .regions
            .remove(&addr)
            .ok_or_else(|| Fault::new(libc::EINVAL, format!("{:#x} is not allocated", addr)))?;
        self.used -= region.len() as u64;
        Ok(())
    }

    fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.insert(base, bytes);
    }

    fn unmap(&mut self, base: u64) {
        self.regions.remove(&base);
    }

    fn locate(&self, addr: u64, len: u64) -> Result<(u64, usize), Fault> {
        let fault = || Fault::new(libc::EFAULT, format!("bad address {:#x}+{}", addr, len));
        let (base, region) = self.regions.range(..=addr).next_back().ok_or_else(fault)?;
        let end = addr.checked_add(len).ok_or_else(fault)?;
        if end > base + region.len() as u64 {
            return Err(fault());
        }
        Ok((*base, (addr - base) as usize))
    }

    fn read(&self, addr: u64, len: u64) -> Result<Vec<u8>, Fault> {
        let (base, offset) = self.locate(addr, len)?;
        let region = &self.regions[&base];
        Ok(region[offset..offset + len as usize].to_vec())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), Fault> {
        let (base, offset) = self.locate(addr, data.len() as u64)?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or_else(|| Fault::new(libc::EFAULT, format!("bad address {:#x}", addr)))?;
        region[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

struct Lane {
    queue: mpsc::UnboundedSender<(u64, Command)>,
    state: LaneState,
}

/// The control loop of one mock worker.
struct Worker {
    device: Arc<DeviceShared>,
    core: Arc<Core>,
    lanes: HashMap<LaneId, Lane>,
    modules: HashMap<u64, HashMap<String, u64>>,
    next_lane: u64,
    next_module: u64,
    next_code: u64,
}

impl Worker {
    fn new(device: Arc<DeviceShared>, out: mpsc::UnboundedSender<Inbound>) -> Self {
        let limit = device.memory_limit.load(Ordering::SeqCst);
        Self {
            device,
            core: Arc::new(Core {
                out,
                memory: Mutex::new(Memory::new(limit)),
                kernels: DashMap::new(),
                syscalls: DashMap::new(),
                next_token: AtomicU64::new(1),
            }),
            lanes: HashMap::new(),
            modules: HashMap::new(),
            next_lane: 0,
            next_module: 0,
            next_code: 0,
        }
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        while let Some(Request { seq, lane, command }) = requests.recv().await {
            tracing::trace!(seq, command = command.name(), "mock worker received");
            let status = match lane {
                None if command == Command::Exit => {
                    self.device.exits.fetch_add(1, Ordering::SeqCst);
                    self.core.reply(seq, Ok(Payload::Unit));
                    break;
                }
                None => self.control(command),
                Some(lane) => match self.route(seq, lane, command) {
                    Some(status) => status,
                    None => continue,
                },
            };
            self.core.reply(seq, status);
        }

        self.lanes.clear();
        tracing::debug!("mock worker stopped");
    }

    fn control(&mut self, command: Command) -> Response {
        match command {
            Command::Hello | Command::OpenLane => self.open_lane().map(Payload::Lane),
            Command::LoadLibrary { path } => self.load(&path).map(Payload::Word),
            Command::GetSym { module, name } => {
                let symbols = self
                    .modules
                    .get(&module)
                    .ok_or_else(|| Fault::new(libc::EINVAL, format!("unknown module {}", module)))?;
                let addr = symbols
                    .get(&name)
                    .ok_or_else(|| Fault::new(libc::ENOENT, format!("undefined symbol {}", name)))?;
                Ok(Payload::Word(*addr))
            }
            Command::Alloc { size } => self.core.memory().alloc(size).map(Payload::Word),
            Command::Free { addr } => self.core.memory().free(addr).map(|_| Payload::Unit),
            Command::Read { addr, len } => self.core.memory().read(addr, len).map(Payload::Bytes),
            Command::Write { addr, data } => self.core.memory().write(addr, &data).map(|_| Payload::Unit),
            other => Err(Fault::new(libc::EINVAL, format!("{} needs a lane", other.name()))),
        }
    }

    /// Answers out-of-band lane commands; queues the rest on the lane.
    fn route(&mut self, seq: u64, lane: LaneId, command: Command) -> Option<Response> {
        let no_lane = || Fault::new(libc::ESRCH, format!("no such lane {}", lane));
        match command {
            Command::QueryState => Some(
                self.lanes
                    .get(&lane)
                    .map(|l| Payload::State(read_state(&l.state)))
                    .ok_or_else(no_lane),
            ),
            Command::CloseLane => Some(self.lanes.remove(&lane).map(|_| Payload::Unit).ok_or_else(no_lane)),
            Command::SyscallReturn { token, value } => Some(match self.core.syscalls.remove(&token) {
                Some((_, tx)) => {
                    let _ = tx.send(value);
                    Ok(Payload::Unit)
                }
                None => Err(Fault::new(libc::EINVAL, format!("no syscall waiting on token {}", token))),
            }),
            work => {
                let queued = self
                    .lanes
                    .get(&lane)
                    .map(|l| l.queue.send((seq, work)).is_ok())
                    .unwrap_or(false);
                if queued { None } else { Some(Err(no_lane())) }
            }
        }
    }

    fn open_lane(&mut self) -> Result<LaneId, Fault> {
        let limit = self.device.lane_limit.load(Ordering::SeqCst);
        if self.lanes.len() as u64 >= limit {
            return Err(Fault::new(libc::EAGAIN, "lane limit reached"));
        }

        self.next_lane += 1;
        let lane = LaneId(self.next_lane);
        let (queue, jobs) = mpsc::unbounded_channel();
        let state: LaneState = Arc::new(Mutex::new(ContextState::Running));
        tokio::spawn(lane_loop(self.core.clone(), lane, state.clone(), jobs));
        self.lanes.insert(lane, Lane { queue, state });
        Ok(lane)
    }

    fn load(&mut self, path: &str) -> Result<u64, Fault> {
        let library = self
            .device
            .libraries
            .get(path)
            .map(|l| l.value().clone())
            .ok_or_else(|| Fault::new(libc::ENOENT, format!("{}: no such library", path)))?;

        self.next_module += 1;
        let mut symbols = HashMap::new();
        for (name, kernel) in library.functions {
            self.next_code += 1;
            let addr = CODE_BASE + self.next_code * 0x100;
            self.core.kernels.insert(addr, kernel);
            symbols.insert(name, addr);
        }
        self.modules.insert(self.next_module, symbols);
        Ok(self.next_module)
    }
}

async fn lane_loop(
    core: Arc<Core>,
    lane: LaneId,
    state: LaneState,
    mut jobs: mpsc::UnboundedReceiver<(u64, Command)>,
) {
    while let Some((seq, command)) = jobs.recv().await {
        let status = match command {
            Command::Call { addr, args } => Ok(Payload::Completed(core.call(lane, &state, addr, args).await)),
            other => core.transfer(other),
        };
        core.reply(seq, status);
    }
    tracing::trace!(%lane, "mock lane stopped");
}
