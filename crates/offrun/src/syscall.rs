//! # Syscall Relay
//!
//! Device code cannot perform some system calls on its own; the worker hands
//! them to the host, which answers on behalf of the lane.

use crate::handles::LaneId;

/// Host-side handler for system calls relayed by a lane.
pub trait SyscallHandler: Send + Sync + 'static {
    /// Performs syscall `nr` for `lane` and returns the raw return value
    /// (negative errno on failure).
    fn handle(&self, lane: LaneId, nr: u64, args: &[u64]) -> i64;
}

/// Answers every relayed syscall with `-ENOSYS`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unsupported;

impl SyscallHandler for Unsupported {
    fn handle(&self, lane: LaneId, nr: u64, _args: &[u64]) -> i64 {
        tracing::debug!(%lane, nr, "unsupported syscall relayed");
        -(libc::ENOSYS as i64)
    }
}

impl<F> SyscallHandler for F
where
    F: Fn(LaneId, u64, &[u64]) -> i64 + Send + Sync + 'static,
{
    fn handle(&self, lane: LaneId, nr: u64, args: &[u64]) -> i64 {
        self(lane, nr, args)
    }
}
