//! Dense handle tables mapping small integers to owned objects.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

/// A concurrent table handing out non-zero integer handles.
///
/// Handles are never reused, so a stale handle can only miss.
pub struct HandleTable<T> {
    entries: DashMap<u64, T>,
    next: AtomicU64,
}

impl<T: Clone> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, value: T) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: u64) -> Option<T> {
        self.entries.get(&handle).map(|e| e.value().clone())
    }

    pub fn remove(&self, handle: u64) -> Option<T> {
        self.entries.remove(&handle).map(|(_, v)| v)
    }

    /// Applies `f` to the entry in place. Returns false for an unknown handle.
    pub fn update(&self, handle: u64, f: impl FnOnce(&mut T)) -> bool {
        match self.entries.get_mut(&handle) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Every live handle, in no particular order.
    pub fn handles(&self) -> Vec<u64> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn retain(&self, keep: impl FnMut(&u64, &mut T) -> bool) {
        self.entries.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
