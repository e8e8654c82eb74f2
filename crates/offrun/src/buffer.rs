//! Host memory shared with an in-flight asynchronous read.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

/// A host buffer an asynchronous read lands in.
///
/// The lane fills it when the transfer completes; read it back once the
/// request has been observed as finished.
#[derive(Clone, Debug, Default)]
pub struct HostBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// A zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Overwrites the head of the buffer with `src`.
    pub(crate) fn fill_from(&self, src: &[u8]) -> bool {
        let mut data = self.lock();
        if src.len() > data.len() {
            return false;
        }
        data[..src.len()].copy_from_slice(src);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<Vec<u8>> for HostBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data: Arc::new(Mutex::new(data)) }
    }
}
