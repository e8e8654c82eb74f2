//! # Transport Abstraction
//!
//! The seams to the plumbing that actually reaches the device.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: A Transport moves typed [`Request`] frames to the worker
//!   and [`Inbound`] frames back. Turning them into bytes on a socket or a
//!   shared-memory ring is the transport's own business.
//! - **Launch Is External**: Spawning the worker binary and loading it onto the
//!   device happens behind [`Launcher`]. The core only receives a connected
//!   transport.

use std::fmt;
use std::path::PathBuf;

use crate::frame::Inbound;
use crate::frame::Request;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The worker could not be started with the given configuration.
    Rejected { code: i32, reason: String },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl Error {
    pub fn errno(&self) -> i32 {
        match self {
            Self::ConnectionLost(_) => libc::ECONNRESET,
            Self::Rejected { code, .. } => *code,
            Self::Io(_) => libc::EIO,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Rejected { code, reason } => write!(f, "Launch rejected: {} (errno {})", reason, code),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional frame channel to one worker.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one request frame to the worker.
    async fn send(&self, request: Request) -> Result<()>;

    /// Receives the next frame from the worker.
    ///
    /// # invariants
    /// - Returns `Ok(None)` once the worker side has closed the channel.
    /// - Only one task (the channel pump) calls `recv` at a time.
    async fn recv(&self) -> Result<Option<Inbound>>;

    /// Releases the underlying connection. Called once, after `Exit`.
    async fn close(&self) {}
}

/// Starts a worker on a device and connects to it.
#[async_trait::async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, config: &WorkerConfig) -> Result<Box<dyn Transport>>;
}

/// Pre-resolved locations needed to start a worker.
///
/// Templating a node index into these paths belongs to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Control socket of the device's operating system service.
    pub os_socket: PathBuf,
    /// Device file of the accelerator.
    pub device: PathBuf,
    /// Worker binary to run on the device.
    pub worker_binary: PathBuf,
}

impl WorkerConfig {
    pub fn new(
        os_socket: impl Into<PathBuf>,
        device: impl Into<PathBuf>,
        worker_binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            os_socket: os_socket.into(),
            device: device.into(),
            worker_binary: worker_binary.into(),
        }
    }
}
