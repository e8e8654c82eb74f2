//! Fixed integer codes handed across the boundary.

use offrun::ContextState;
use offrun::Outcome;

/// Version of the boundary contract.
pub const API_VERSION: i32 = 4;

/// Returned instead of a request id when nothing was enqueued.
pub const REQUEST_ID_INVALID: u64 = offrun::RequestId::INVALID.0;

pub const COMMAND_OK: i32 = 0;
pub const COMMAND_EXCEPTION: i32 = 1;
pub const COMMAND_ERROR: i32 = 2;
/// Only reported by a peek; the request is still in flight.
pub const COMMAND_UNFINISHED: i32 = 3;
/// Unknown handle or request, or a failure of the runtime itself.
pub const COMMAND_INTERNAL: i32 = -1;

pub const STATE_UNKNOWN: i32 = 0;
pub const STATE_RUNNING: i32 = 1;
pub const STATE_SYSCALL: i32 = 2;
pub const STATE_BLOCKED: i32 = 3;
pub const STATE_EXIT: i32 = 4;

pub const ALLOC_OK: i32 = 0;
pub const ALLOC_FAILED: i32 = -1;
pub const ALLOC_INTERNAL: i32 = -2;

pub fn state_code(state: ContextState) -> i32 {
    match state {
        ContextState::Running => STATE_RUNNING,
        ContextState::InSyscall => STATE_SYSCALL,
        ContextState::Blocked => STATE_BLOCKED,
        ContextState::Exited => STATE_EXIT,
    }
}

/// Status code and return value for a finished request.
pub fn outcome_code(outcome: Outcome) -> (i32, u64) {
    match outcome {
        Outcome::Ready(value) => (COMMAND_OK, value),
        Outcome::Exception(code) => (COMMAND_EXCEPTION, code),
        Outcome::Error => (COMMAND_ERROR, 0),
    }
}
