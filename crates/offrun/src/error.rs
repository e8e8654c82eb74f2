//! # Error taxonomy
//!
//! Every fallible operation of the core returns one of these variants. Each
//! variant maps to an OS-style code through [`Error::errno`], which the
//! boundary layer logs next to the fixed return code it hands to callers.

use crate::args;
use crate::handles::LibraryHandle;
use crate::handles::RequestId;
use crate::transport;

/// Reasons a call or transfer could not be enqueued on a context.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// The context is exited or closing and accepts no more work.
    Exited,
    /// The call target was the null address.
    NullTarget,
    /// The argument list could not be snapshotted.
    Args(args::Error),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited => write!(f, "context no longer accepts requests"),
            Self::NullTarget => write!(f, "call target is the null address"),
            Self::Args(e) => write!(f, "bad arguments: {}", e),
        }
    }
}

/// Reasons a context could not be closed.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseError {
    /// The main context lives as long as its process.
    MainContext,
    /// The worker refused or failed to tear down the lane.
    Lane(String),
}

impl std::fmt::Display for CloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MainContext => write!(f, "the main context cannot be closed"),
            Self::Lane(msg) => write!(f, "lane teardown failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Error {
    /// The worker could not be launched or did not complete the handshake.
    ProcessCreation { reason: String, code: i32 },
    /// The process was terminated or its channel is gone.
    ProcessNotAvailable,
    /// The worker could not start a new lane.
    ContextCreation { reason: String, code: i32 },
    /// The library is missing or was rejected by the remote loader.
    LibraryLoad { path: String, reason: String, code: i32 },
    /// The handle does not name a library loaded into this process.
    UnknownLibrary(LibraryHandle),
    SymbolNotFound { library: LibraryHandle, name: String },
    OutOfRemoteMemory { size: u64 },
    /// Free of an address that is not a live allocation.
    InvalidAddress(u64),
    Dispatch(DispatchError),
    /// Unknown, consumed or invalidated request id.
    InvalidRequest(RequestId),
    Close(CloseError),
    /// A synchronous or asynchronous memory transfer failed.
    Transfer { addr: u64, len: u64, reason: String, code: i32 },
    /// The worker answered with something the protocol does not allow.
    Protocol(String),
    Transport(transport::Error),
}

impl Error {
    /// OS-style error code for diagnostics.
    pub fn errno(&self) -> i32 {
        match self {
            Self::ProcessCreation { code, .. } => *code,
            Self::ProcessNotAvailable => libc::ESRCH,
            Self::ContextCreation { code, .. } => *code,
            Self::LibraryLoad { code, .. } => *code,
            Self::UnknownLibrary(_) => libc::EINVAL,
            Self::SymbolNotFound { .. } => libc::ENOENT,
            Self::OutOfRemoteMemory { .. } => libc::ENOMEM,
            Self::InvalidAddress(_) => libc::EINVAL,
            Self::Dispatch(DispatchError::Exited) => libc::ESRCH,
            Self::Dispatch(DispatchError::Args(args::Error::StackTooLarge { .. })) => libc::E2BIG,
            Self::Dispatch(_) => libc::EINVAL,
            Self::InvalidRequest(_) => libc::EINVAL,
            Self::Close(CloseError::MainContext) => libc::EINVAL,
            Self::Close(CloseError::Lane(_)) => libc::EIO,
            Self::Transfer { code, .. } => *code,
            Self::Protocol(_) => libc::EPROTO,
            Self::Transport(e) => e.errno(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessCreation { reason, code } => write!(f, "process creation failed: {} (errno {})", reason, code),
            Self::ProcessNotAvailable => write!(f, "process not available"),
            Self::ContextCreation { reason, code } => write!(f, "context creation failed: {} (errno {})", reason, code),
            Self::LibraryLoad { path, reason, code } => write!(f, "failed to load '{}': {} (errno {})", path, reason, code),
            Self::UnknownLibrary(lib) => write!(f, "unknown library handle: {}", lib),
            Self::SymbolNotFound { library, name } => write!(f, "symbol '{}' not found in {}", name, library),
            Self::OutOfRemoteMemory { size } => write!(f, "out of remote memory allocating {} bytes", size),
            Self::InvalidAddress(addr) => write!(f, "invalid remote address: {:#x}", addr),
            Self::Dispatch(e) => write!(f, "dispatch failed: {}", e),
            Self::InvalidRequest(id) => write!(f, "invalid request: {}", id),
            Self::Close(e) => write!(f, "close failed: {}", e),
            Self::Transfer { addr, len, reason, .. } => write!(f, "transfer of {} bytes at {:#x} failed: {}", len, addr, reason),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Dispatch(DispatchError::Args(e)) => Some(e),
            _ => None,
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

impl From<CloseError> for Error {
    fn from(e: CloseError) -> Self {
        Self::Close(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
