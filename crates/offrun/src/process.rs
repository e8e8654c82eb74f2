//! # Process Manager
//!
//! The root lifetime owner. A [`Process`] is one worker running on the
//! device: it owns the control channel, the remote address space, the library
//! table and every context opened inside it.
//!
//! After [`Process::terminate`] every operation fails with
//! `ProcessNotAvailable`, every context reports `Exited` and every request
//! still pending is invalidated.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::channel::Channel;
use crate::context::Context;
use crate::context::Registry;
use crate::context::Wiring;
use crate::error::Error;
use crate::error::Result;
use crate::frame::Command;
use crate::handles::ContextId;
use crate::handles::LibraryHandle;
use crate::space::AddressSpace;
use crate::syscall;
use crate::syscall::SyscallHandler;
use crate::transport::Launcher;
use crate::transport::WorkerConfig;

/// Handle to one remote worker. Cheap to clone; all clones share the process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkerConfig,
    channel: Arc<Channel>,
    space: Arc<AddressSpace>,
    syscalls: Arc<dyn SyscallHandler>,
    main: Context,
    contexts: Arc<Registry>,
    next_context: AtomicU64,
    alive: AtomicBool,
}

impl Process {
    /// Launches a worker and opens its main context.
    ///
    /// Relayed syscalls are answered with `-ENOSYS`.
    pub async fn create(launcher: &dyn Launcher, config: &WorkerConfig) -> Result<Self> {
        Self::create_with(launcher, config, Arc::new(syscall::Unsupported)).await
    }

    /// Like [`Process::create`], with a custom handler for relayed syscalls.
    pub async fn create_with(
        launcher: &dyn Launcher,
        config: &WorkerConfig,
        syscalls: Arc<dyn SyscallHandler>,
    ) -> Result<Self> {
        let transport = launcher.launch(config).await.map_err(|e| Error::ProcessCreation {
            reason: e.to_string(),
            code: e.errno(),
        })?;

        let channel = Arc::new(Channel::new(transport));
        let lane = match channel.request(None, Command::Hello).await {
            Ok(Ok(payload)) => payload.lane().map_err(|e| Error::ProcessCreation {
                reason: format!("bad handshake: {}", e),
                code: e.errno(),
            }),
            Ok(Err(fault)) => Err(Error::ProcessCreation { reason: fault.message, code: fault.code }),
            Err(e) => Err(Error::ProcessCreation { reason: e.to_string(), code: e.errno() }),
        };
        let lane = match lane {
            Ok(lane) => lane,
            Err(e) => {
                channel.shutdown().await;
                return Err(e);
            }
        };

        let space = Arc::new(AddressSpace::new(channel.clone()));
        let contexts: Arc<Registry> = Arc::new(DashMap::new());

        let main_id = ContextId(1);
        let main = Context::start(main_id, lane, true, Wiring {
            channel: channel.clone(),
            space: space.clone(),
            syscalls: syscalls.clone(),
            registry: Arc::downgrade(&contexts),
        });
        contexts.insert(main_id, main.clone());

        tracing::info!(
            worker = %config.worker_binary.display(),
            device = %config.device.display(),
            %lane,
            "process created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                channel,
                space,
                syscalls,
                main,
                contexts,
                next_context: AtomicU64::new(main_id.0 + 1),
                alive: AtomicBool::new(true),
            }),
        })
    }

    /// Stops the worker and invalidates everything inside the process.
    ///
    /// A second call is a no-op.
    pub async fn terminate(&self) -> Result<()> {
        if !self.inner.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.invalidate_contexts();
        self.inner.space.clear().await;

        match self.inner.channel.request(None, Command::Exit).await {
            Ok(Ok(_)) => {}
            Ok(Err(fault)) => tracing::warn!(%fault, "worker refused to exit"),
            Err(e) => tracing::warn!(error = %e, "worker gone before exit"),
        }
        self.inner.channel.shutdown().await;

        tracing::info!(worker = %self.inner.config.worker_binary.display(), "process terminated");
        Ok(())
    }

    /// False once terminated or once the channel to the worker is gone.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst) && !self.inner.channel.is_closed()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub async fn load_library(&self, path: &str) -> Result<LibraryHandle> {
        self.ensure_alive()?;
        self.inner.space.load_library(path).await
    }

    /// Address of `name` inside `library`. Lookups are cached per library.
    pub async fn resolve_symbol(&self, library: LibraryHandle, name: &str) -> Result<u64> {
        self.ensure_alive()?;
        self.inner.space.resolve_symbol(library, name).await
    }

    pub async fn library_path(&self, library: LibraryHandle) -> Option<String> {
        self.inner.space.library_path(library).await
    }

    pub async fn allocate(&self, size: u64) -> Result<u64> {
        self.ensure_alive()?;
        self.inner.space.allocate(size).await
    }

    pub async fn free(&self, addr: u64) -> Result<()> {
        self.ensure_alive()?;
        self.inner.space.free(addr).await
    }

    /// Live allocations as `(address, size)`, sorted by address.
    pub fn regions(&self) -> Vec<(u64, u64)> {
        self.inner.space.live_regions()
    }

    /// Copies `dst.len()` bytes from remote `src` into `dst`.
    pub async fn read_mem(&self, dst: &mut [u8], src: u64) -> Result<()> {
        self.ensure_alive()?;
        self.inner.space.read(dst, src).await
    }

    /// Copies `src` to remote `dst`.
    pub async fn write_mem(&self, dst: u64, src: &[u8]) -> Result<()> {
        self.ensure_alive()?;
        self.inner.space.write(dst, src).await
    }

    /// Opens a new lane on the worker.
    pub async fn open_context(&self) -> Result<Context> {
        self.ensure_alive()?;

        let lane = match self.inner.channel.request(None, Command::OpenLane).await? {
            Ok(payload) => payload.lane()?,
            Err(fault) => {
                return Err(Error::ContextCreation { reason: fault.message, code: fault.code });
            }
        };

        let id = ContextId(self.inner.next_context.fetch_add(1, Ordering::Relaxed));
        let context = Context::start(id, lane, false, self.inner.wiring());
        self.inner.contexts.insert(id, context.clone());

        // terminate may have swept the registry between the round trip and the insert
        if !self.is_alive() {
            context.invalidate();
            self.inner.contexts.remove(&id);
            return Err(Error::ProcessNotAvailable);
        }

        tracing::debug!(%id, %lane, "context opened");
        Ok(context)
    }

    pub fn main_context(&self) -> Context {
        self.inner.main.clone()
    }

    /// Every open context, main included, ordered by id.
    pub fn contexts(&self) -> Vec<Context> {
        let mut contexts: Vec<Context> = self.inner.contexts.iter().map(|e| e.value().clone()).collect();
        contexts.sort_by_key(|c| c.id());
        contexts
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::ProcessNotAvailable)
        }
    }
}

impl Inner {
    fn wiring(&self) -> Wiring {
        Wiring {
            channel: self.channel.clone(),
            space: self.space.clone(),
            syscalls: self.syscalls.clone(),
            registry: Arc::downgrade(&self.contexts),
        }
    }

    fn invalidate_contexts(&self) {
        let contexts: Vec<Context> = self.contexts.iter().map(|e| e.value().clone()).collect();
        for context in contexts {
            context.invalidate();
        }
        self.contexts.clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::warn!(worker = %self.config.worker_binary.display(), "process dropped without terminate");
            self.invalidate_contexts();
            self.channel.abort();
        }
    }
}
