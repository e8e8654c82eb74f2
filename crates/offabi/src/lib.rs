//! # offabi
//!
//! Synchronous, handle-based facade over `offrun`.
//!
//! Every object crosses the boundary as a non-zero integer handle, and every
//! failure as a fixed code from [`codes`]. The typed error is logged before it
//! is flattened, so the cause stays visible with `OFFRUN_LOG=debug`.
//!
//! [`Api`] owns the tokio runtime that drives the core; its methods block the
//! calling thread and must not be called from inside an async task.

pub mod codes;
pub mod config;
pub mod handles;

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use offrun::CallArgs;
use offrun::CloseError;
use offrun::Context;
use offrun::Error;
use offrun::HostBuffer;
use offrun::Intent;
use offrun::Launcher;
use offrun::LibraryHandle;
use offrun::Process;
use offrun::RequestId;
use offrun::Scalar;
use offrun::WorkerConfig;
use tokio::runtime::Runtime;

use crate::codes::*;
use crate::handles::HandleTable;

#[derive(Clone)]
struct ProcEntry {
    process: Process,
    main: u64,
}

#[derive(Clone)]
struct ContextEntry {
    proc: u64,
    context: Context,
}

type SharedArgs = Arc<Mutex<CallArgs>>;

pub struct Api {
    runtime: Runtime,
    launcher: Arc<dyn Launcher>,
    procs: HandleTable<ProcEntry>,
    contexts: HandleTable<ContextEntry>,
    args: HandleTable<SharedArgs>,
}

fn failed(op: &str, e: &Error) {
    tracing::error!(op, errno = e.errno(), error = %e, "operation failed");
}

impl Api {
    /// Starts the runtime and installs logging.
    pub fn new(launcher: Arc<dyn Launcher>) -> std::io::Result<Self> {
        config::init_logging();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("offrun")
            .build()?;

        Ok(Self {
            runtime,
            launcher,
            procs: HandleTable::new(),
            contexts: HandleTable::new(),
            args: HandleTable::new(),
        })
    }

    pub fn api_version(&self) -> i32 {
        API_VERSION
    }

    pub fn version_string(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    // process

    /// Creates a process on `node` with the worker named by the environment.
    pub fn proc_create(&self, node: u32) -> u64 {
        self.proc_create_config(config::for_node(node, None))
    }

    /// Creates a process on `node` with an explicit worker binary.
    pub fn proc_create_static(&self, node: u32, worker: &Path) -> u64 {
        self.proc_create_config(config::for_node(node, Some(worker)))
    }

    /// Creates a process from explicit paths.
    pub fn proc_create_with(&self, os_socket: &Path, device: &Path, worker: &Path) -> u64 {
        self.proc_create_config(WorkerConfig::new(os_socket, device, worker))
    }

    fn proc_create_config(&self, config: WorkerConfig) -> u64 {
        let process = match self.runtime.block_on(Process::create(self.launcher.as_ref(), &config)) {
            Ok(process) => process,
            Err(e) => {
                failed("proc_create", &e);
                return 0;
            }
        };

        let proc = self.procs.insert(ProcEntry { process: process.clone(), main: 0 });
        let main = self.contexts.insert(ContextEntry { proc, context: process.main_context() });
        self.procs.update(proc, |entry| entry.main = main);
        proc
    }

    pub fn proc_destroy(&self, proc: u64) -> i32 {
        let Some(entry) = self.procs.remove(proc) else {
            return -1;
        };
        self.contexts.retain(|_, c| c.proc != proc);

        match self.runtime.block_on(entry.process.terminate()) {
            Ok(()) => 0,
            Err(e) => {
                failed("proc_destroy", &e);
                -1
            }
        }
    }

    /// Handle of the process' main context, or 0.
    pub fn main_context(&self, proc: u64) -> u64 {
        self.procs.get(proc).map(|p| p.main).unwrap_or(0)
    }

    pub fn load_library(&self, proc: u64, path: &str) -> u64 {
        let Some(entry) = self.procs.get(proc) else {
            return 0;
        };
        match self.runtime.block_on(entry.process.load_library(path)) {
            Ok(lib) => lib.0,
            Err(e) => {
                failed("load_library", &e);
                0
            }
        }
    }

    pub fn get_sym(&self, proc: u64, lib: u64, name: &str) -> u64 {
        let Some(entry) = self.procs.get(proc) else {
            return 0;
        };
        match self.runtime.block_on(entry.process.resolve_symbol(LibraryHandle(lib), name)) {
            Ok(addr) => addr,
            Err(e) => {
                failed("get_sym", &e);
                0
            }
        }
    }

    // memory

    /// Allocates `size` bytes and stores the address in `addr`.
    pub fn alloc_mem(&self, proc: u64, addr: &mut u64, size: u64) -> i32 {
        let Some(entry) = self.procs.get(proc) else {
            return ALLOC_INTERNAL;
        };
        match self.runtime.block_on(entry.process.allocate(size)) {
            Ok(a) => {
                *addr = a;
                ALLOC_OK
            }
            Err(e @ Error::OutOfRemoteMemory { .. }) => {
                failed("alloc_mem", &e);
                ALLOC_FAILED
            }
            Err(e) => {
                failed("alloc_mem", &e);
                ALLOC_INTERNAL
            }
        }
    }

    pub fn free_mem(&self, proc: u64, addr: u64) -> i32 {
        let Some(entry) = self.procs.get(proc) else {
            return -1;
        };
        self.status("free_mem", entry.process.free(addr))
    }

    pub fn read_mem(&self, proc: u64, dst: &mut [u8], src: u64) -> i32 {
        let Some(entry) = self.procs.get(proc) else {
            return -1;
        };
        self.status("read_mem", entry.process.read_mem(dst, src))
    }

    pub fn write_mem(&self, proc: u64, dst: u64, src: &[u8]) -> i32 {
        let Some(entry) = self.procs.get(proc) else {
            return -1;
        };
        self.status("write_mem", entry.process.write_mem(dst, src))
    }

    fn status(&self, op: &str, fut: impl Future<Output = offrun::Result<()>>) -> i32 {
        match self.runtime.block_on(fut) {
            Ok(()) => 0,
            Err(e) => {
                failed(op, &e);
                -1
            }
        }
    }

    // contexts

    pub fn context_open(&self, proc: u64) -> u64 {
        let Some(entry) = self.procs.get(proc) else {
            return 0;
        };
        match self.runtime.block_on(entry.process.open_context()) {
            Ok(context) => self.contexts.insert(ContextEntry { proc, context }),
            Err(e) => {
                failed("context_open", &e);
                0
            }
        }
    }

    /// Closes a context. The main context is refused with `-EINVAL`.
    pub fn context_close(&self, ctx: u64) -> i32 {
        let Some(entry) = self.contexts.get(ctx) else {
            return -1;
        };
        match self.runtime.block_on(entry.context.close()) {
            Ok(()) => {
                self.contexts.remove(ctx);
                0
            }
            Err(Error::Close(CloseError::MainContext)) => -libc::EINVAL,
            Err(e) => {
                failed("context_close", &e);
                -1
            }
        }
    }

    pub fn get_context_state(&self, ctx: u64) -> i32 {
        self.contexts
            .get(ctx)
            .map(|c| state_code(c.context.state()))
            .unwrap_or(STATE_UNKNOWN)
    }

    // calls

    pub fn call_async(&self, ctx: u64, addr: u64, args: u64) -> u64 {
        let (Some(entry), Some(args)) = (self.contexts.get(ctx), self.args.get(args)) else {
            return REQUEST_ID_INVALID;
        };
        let args = lock(&args);
        Self::request_id("call_async", entry.context.call_async(addr, &args))
    }

    pub fn call_async_by_name(&self, ctx: u64, lib: u64, symbol: &str, args: u64) -> u64 {
        let (Some(entry), Some(args)) = (self.contexts.get(ctx), self.args.get(args)) else {
            return REQUEST_ID_INVALID;
        };
        let args = lock(&args).clone();
        let result = self
            .runtime
            .block_on(entry.context.call_async_by_name(LibraryHandle(lib), symbol, &args));
        Self::request_id("call_async_by_name", result)
    }

    pub fn async_read_mem(&self, ctx: u64, dst: &HostBuffer, src: u64, size: usize) -> u64 {
        let Some(entry) = self.contexts.get(ctx) else {
            return REQUEST_ID_INVALID;
        };
        Self::request_id("async_read_mem", entry.context.async_read_mem(dst, src, size))
    }

    pub fn async_write_mem(&self, ctx: u64, dst: u64, src: &[u8]) -> u64 {
        let Some(entry) = self.contexts.get(ctx) else {
            return REQUEST_ID_INVALID;
        };
        Self::request_id("async_write_mem", entry.context.async_write_mem(dst, src))
    }

    fn request_id(op: &str, result: offrun::Result<RequestId>) -> u64 {
        match result {
            Ok(id) => id.0,
            Err(e) => {
                failed(op, &e);
                REQUEST_ID_INVALID
            }
        }
    }

    /// Picks up a finished request without blocking.
    pub fn call_peek_result(&self, ctx: u64, id: u64, retval: &mut u64) -> i32 {
        let Some(entry) = self.contexts.get(ctx) else {
            return COMMAND_INTERNAL;
        };
        match entry.context.peek_result(RequestId(id)) {
            Ok(Some(outcome)) => Self::store(outcome, retval),
            Ok(None) => COMMAND_UNFINISHED,
            Err(e) => {
                failed("call_peek_result", &e);
                COMMAND_INTERNAL
            }
        }
    }

    /// Blocks until the request finishes.
    pub fn call_wait_result(&self, ctx: u64, id: u64, retval: &mut u64) -> i32 {
        let Some(entry) = self.contexts.get(ctx) else {
            return COMMAND_INTERNAL;
        };
        match self.runtime.block_on(entry.context.wait_result(RequestId(id))) {
            Ok(outcome) => Self::store(outcome, retval),
            Err(e) => {
                failed("call_wait_result", &e);
                COMMAND_INTERNAL
            }
        }
    }

    fn store(outcome: offrun::Outcome, retval: &mut u64) -> i32 {
        let (code, value) = outcome_code(outcome);
        *retval = value;
        code
    }

    // arguments

    pub fn args_alloc(&self) -> u64 {
        self.args.insert(Arc::new(Mutex::new(CallArgs::new())))
    }

    pub fn args_set_i32(&self, args: u64, argnum: i32, value: i32) -> i32 {
        self.set_scalar(args, argnum, value.into())
    }

    pub fn args_set_u32(&self, args: u64, argnum: i32, value: u32) -> i32 {
        self.set_scalar(args, argnum, value.into())
    }

    pub fn args_set_i64(&self, args: u64, argnum: i32, value: i64) -> i32 {
        self.set_scalar(args, argnum, value.into())
    }

    pub fn args_set_u64(&self, args: u64, argnum: i32, value: u64) -> i32 {
        self.set_scalar(args, argnum, value.into())
    }

    pub fn args_set_float(&self, args: u64, argnum: i32, value: f32) -> i32 {
        self.set_scalar(args, argnum, value.into())
    }

    pub fn args_set_double(&self, args: u64, argnum: i32, value: f64) -> i32 {
        self.set_scalar(args, argnum, value.into())
    }

    /// Copies `buf` to the callee's stack and passes its address as argument `argnum`.
    pub fn args_set_stack(&self, args: u64, intent: Intent, argnum: i32, buf: &[u8]) -> i32 {
        self.with_args(args, argnum, |list, index| list.set_on_stack(intent, index, buf))
    }

    pub fn args_clear(&self, args: u64) {
        if let Some(list) = self.args.get(args) {
            lock(&list).clear();
        }
    }

    pub fn args_free(&self, args: u64) {
        self.args.remove(args);
    }

    fn set_scalar(&self, args: u64, argnum: i32, value: Scalar) -> i32 {
        self.with_args(args, argnum, |list, index| list.set(index, value))
    }

    fn with_args(
        &self,
        args: u64,
        argnum: i32,
        set: impl FnOnce(&mut CallArgs, usize) -> offrun::args::Result<()>,
    ) -> i32 {
        let (Some(list), Ok(index)) = (self.args.get(args), usize::try_from(argnum)) else {
            return -1;
        };
        let mut list = lock(&list);
        match set(&mut list, index) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(argnum, error = %e, "cannot set argument");
                -1
            }
        }
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        for proc in self.procs.handles() {
            tracing::warn!(proc, "process still open at shutdown");
            self.proc_destroy(proc);
        }
    }
}

fn lock(args: &SharedArgs) -> std::sync::MutexGuard<'_, CallArgs> {
    args.lock().unwrap_or_else(PoisonError::into_inner)
}
