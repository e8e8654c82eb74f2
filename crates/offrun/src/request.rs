//! # Pending-Request Table
//!
//! Tracks every request submitted to one context until its result has been
//! picked up.
//!
//! ## Invariants
//!
//! - Ids are handed out from a per-table counter starting at 1 and are never reused.
//! - A record is removed by the first retrieval that observes it terminal.
//!   Every later query on the same id yields `InvalidRequest`.
//! - A waiter is woken through the record's watch channel; dropping the record
//!   (invalidation) wakes it as well.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::Error;
use crate::error::Result;
use crate::handles::RequestId;

/// Terminal status of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The function returned (or the transfer finished) with this value.
    Ready(u64),
    /// Device code raised an exception; the value carries its code.
    Exception(u64),
    /// The request could not be carried out.
    Error,
}

type Slot = watch::Sender<Option<Outcome>>;

pub(crate) struct RequestTable {
    next_id: AtomicU64,
    entries: DashMap<RequestId, Slot>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Creates a pending record under a fresh id.
    pub fn register(&self) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, _) = watch::channel(None);
        self.entries.insert(id, tx);
        id
    }

    /// Drops a record that never made it onto the lane.
    pub fn cancel(&self, id: RequestId) {
        self.entries.remove(&id);
    }

    /// Stores the terminal status. A no-op for invalidated records.
    pub fn complete(&self, id: RequestId, outcome: Outcome) {
        if let Some(slot) = self.entries.get(&id) {
            slot.send_replace(Some(outcome));
        }
    }

    /// Non-blocking retrieval. `Ok(None)` while the request is in flight.
    pub fn peek(&self, id: RequestId) -> Result<Option<Outcome>> {
        if let Some(outcome) = self.take_terminal(id) {
            return Ok(Some(outcome));
        }
        if self.entries.contains_key(&id) {
            Ok(None)
        } else {
            Err(Error::InvalidRequest(id))
        }
    }

    /// Removes and returns a terminal record, or fails if there is none.
    pub fn take(&self, id: RequestId) -> Result<Outcome> {
        self.take_terminal(id).ok_or(Error::InvalidRequest(id))
    }

    pub fn subscribe(&self, id: RequestId) -> Option<watch::Receiver<Option<Outcome>>> {
        self.entries.get(&id).map(|slot| slot.subscribe())
    }

    /// Number of records not yet terminal.
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| e.value().borrow().is_none()).count()
    }

    /// Forgets every record, waking all waiters. Returns how many were dropped.
    pub fn invalidate_all(&self) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.entries.remove(id).is_some()).count()
    }

    fn take_terminal(&self, id: RequestId) -> Option<Outcome> {
        let (_, slot) = self.entries.remove_if(&id, |_, slot| slot.borrow().is_some())?;
        let outcome = *slot.borrow();
        outcome
    }
}
