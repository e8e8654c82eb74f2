//! Type-safe handles for runtime resources.
//!
//! Instead of passing raw integers around, offrun uses strongly-typed handles
//! so a library handle can never be mistaken for a request id or a lane.

/// Identifier of one outstanding call or memory transfer on a context.
///
/// Ids start at 1 and grow monotonically per context; they are never reused.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Reserved sentinel, never handed out for a live request.
    pub const INVALID: RequestId = RequestId(u64::MAX);

    pub fn is_valid(self) -> bool {
        self.0 != 0 && self != Self::INVALID
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Handle to a library loaded into a remote process.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct LibraryHandle(pub u64);

impl std::fmt::Display for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lib-{}", self.0)
    }
}

/// Host-side identifier of a context within its process.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Worker-side identifier of the thread backing a context.
///
/// Assigned by the worker when the lane is opened.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct LaneId(pub u64);

impl std::fmt::Display for LaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lane-{}", self.0)
    }
}
