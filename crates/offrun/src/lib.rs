//! # offrun
//!
//! Host-side control plane for offloading work to a remote vector device.
//!
//! A [`Process`] owns one worker running on the device, its remote address
//! space and a set of [`Context`] lanes. Calls and memory transfers are
//! submitted to a lane, return a [`RequestId`] immediately, and are picked up
//! later with [`Context::peek_result`] or [`Context::wait_result`].
//!
//! ## Layout
//!
//! - `args`: argument builder and the immutable snapshot taken at dispatch.
//! - `space`: remote allocations and the library/symbol table.
//! - `context`: lanes, their state machine and pending-request tables.
//! - `process`: the root lifetime owner.
//! - `channel`: the pump correlating replies with outstanding frames.
//! - `transport`, `frame`, `syscall`: the collaborator seams.

pub mod args;
pub mod buffer;
pub mod channel;
pub mod context;
pub mod error;
pub mod frame;
pub mod handles;
pub mod mock_device;
pub mod process;
pub mod request;
pub mod space;
pub mod syscall;
pub mod transport;

pub use args::CallArgs;
pub use args::Intent;
pub use args::Scalar;
pub use buffer::HostBuffer;
pub use context::Context;
pub use context::ContextState;
pub use error::CloseError;
pub use error::DispatchError;
pub use error::Error;
pub use error::Result;
pub use handles::ContextId;
pub use handles::LaneId;
pub use handles::LibraryHandle;
pub use handles::RequestId;
pub use process::Process;
pub use request::Outcome;
pub use syscall::SyscallHandler;
pub use transport::Launcher;
pub use transport::Transport;
pub use transport::WorkerConfig;

#[cfg(test)]
mod tests;
