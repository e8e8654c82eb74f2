//! # Protocol Frames
//!
//! The messages exchanged between the host and the worker.
//!
//! ## Invariants
//! - Every [`Request`] is answered by exactly one [`Reply`] carrying the same `seq`.
//! - Requests tagged with a lane are executed by that lane's worker thread in
//!   arrival order. `QueryState`, `CloseLane` and `SyscallReturn` are answered
//!   out of band and never wait behind lane work.
//! - [`Notice`] frames are unsolicited and never answered.

use crate::args::ArgsImage;
use crate::context::ContextState;
use crate::error::Error;
use crate::error::Result;
use crate::handles::LaneId;
use crate::request::Outcome;

/// An outbound frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub seq: u64,
    /// `None` addresses the worker's control loop.
    pub lane: Option<LaneId>,
    pub command: Command,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// First frame on a fresh channel; answered with the main lane.
    Hello,
    /// Asks the worker to exit. Nothing is answered after the reply.
    Exit,
    LoadLibrary { path: String },
    GetSym { module: u64, name: String },
    Alloc { size: u64 },
    Free { addr: u64 },
    Read { addr: u64, len: u64 },
    Write { addr: u64, data: Vec<u8> },
    OpenLane,
    CloseLane,
    QueryState,
    Call { addr: u64, args: ArgsImage },
    /// Result of a syscall relayed to the host.
    SyscallReturn { token: u64, value: i64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Exit => "exit",
            Self::LoadLibrary { .. } => "load-library",
            Self::GetSym { .. } => "get-sym",
            Self::Alloc { .. } => "alloc",
            Self::Free { .. } => "free",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::OpenLane => "open-lane",
            Self::CloseLane => "close-lane",
            Self::QueryState => "query-state",
            Self::Call { .. } => "call",
            Self::SyscallReturn { .. } => "syscall-return",
        }
    }
}

/// An inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Reply(Reply),
    Notice { lane: LaneId, notice: Notice },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub seq: u64,
    pub status: Response,
}

/// The worker's answer to a single request.
pub type Response = std::result::Result<Payload, Fault>;

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Unit,
    /// A remote address or module handle.
    Word(u64),
    Lane(LaneId),
    Bytes(Vec<u8>),
    State(ContextState),
    Completed(Outcome),
}

impl Payload {
    pub fn word(self) -> Result<u64> {
        match self {
            Self::Word(w) => Ok(w),
            other => Err(unexpected("word", &other)),
        }
    }

    pub fn lane(self) -> Result<LaneId> {
        match self {
            Self::Lane(l) => Ok(l),
            other => Err(unexpected("lane", &other)),
        }
    }

    pub fn bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(b) => Ok(b),
            other => Err(unexpected("bytes", &other)),
        }
    }

    pub fn state(self) -> Result<ContextState> {
        match self {
            Self::State(s) => Ok(s),
            other => Err(unexpected("state", &other)),
        }
    }

    pub fn unit(self) -> Result<()> {
        match self {
            Self::Unit => Ok(()),
            other => Err(unexpected("unit", &other)),
        }
    }

    pub fn completed(self) -> Result<Outcome> {
        match self {
            Self::Completed(o) => Ok(o),
            other => Err(unexpected("completion", &other)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Word(_) => "word",
            Self::Lane(_) => "lane",
            Self::Bytes(_) => "bytes",
            Self::State(_) => "state",
            Self::Completed(_) => "completion",
        }
    }
}

fn unexpected(expected: &str, found: &Payload) -> Error {
    Error::Protocol(format!("expected {} payload, found {}", expected, found.kind()))
}

/// A failure reported by the worker for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (errno {})", self.message, self.code)
    }
}

/// Unsolicited lane events.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// Device code needs the host to perform a system call.
    Syscall { token: u64, nr: u64, args: Vec<u64> },
    /// The lane changed scheduling state on the device.
    State(ContextState),
}
