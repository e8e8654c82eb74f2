//! # Remote Address Space
//!
//! Host-side bookkeeping of one process' remote memory and loaded libraries.
//!
//! ## Invariants
//!
//! - Allocation and free round trips are serialized, so the region table
//!   always mirrors the worker's allocator.
//! - Live regions never overlap; a worker handing out an overlapping region is
//!   a protocol error.
//! - A transfer that starts inside a tracked region must end inside it.
//!   Addresses outside every region (globals, stack, code) are left to the worker.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::channel::Channel;
use crate::error::Error;
use crate::error::Result;
use crate::frame::Command;
use crate::handles::LibraryHandle;

struct LibraryRecord {
    path: String,
    /// Module handle on the worker side.
    module: u64,
    symbols: HashMap<String, u64>,
}

#[derive(Default)]
struct LibraryTable {
    next: u64,
    entries: HashMap<LibraryHandle, LibraryRecord>,
}

pub struct AddressSpace {
    channel: Arc<Channel>,
    serial: tokio::sync::Mutex<()>,
    regions: Mutex<BTreeMap<u64, u64>>,
    libraries: tokio::sync::Mutex<LibraryTable>,
}

impl AddressSpace {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            serial: tokio::sync::Mutex::new(()),
            regions: Mutex::new(BTreeMap::new()),
            libraries: tokio::sync::Mutex::new(LibraryTable::default()),
        }
    }

    pub async fn allocate(&self, size: u64) -> Result<u64> {
        let _serial = self.serial.lock().await;

        let addr = match self.channel.request(None, Command::Alloc { size }).await? {
            Ok(payload) => payload.word()?,
            Err(fault) => {
                tracing::debug!(size, %fault, "remote allocation refused");
                return Err(Error::OutOfRemoteMemory { size });
            }
        };
        if addr == 0 {
            return Err(Error::OutOfRemoteMemory { size });
        }

        let mut regions = self.regions();
        if overlaps(&regions, addr, size) {
            return Err(Error::Protocol(format!(
                "worker returned {:#x}+{} overlapping a live region", addr, size
            )));
        }
        regions.insert(addr, size);
        Ok(addr)
    }

    pub async fn free(&self, addr: u64) -> Result<()> {
        let _serial = self.serial.lock().await;

        let size = self.regions().remove(&addr).ok_or(Error::InvalidAddress(addr))?;

        match self.channel.request(None, Command::Free { addr }).await {
            Ok(Ok(payload)) => payload.unit(),
            Ok(Err(fault)) => {
                tracing::warn!(addr, %fault, "worker refused to free a tracked region");
                self.regions().insert(addr, size);
                Err(Error::InvalidAddress(addr))
            }
            Err(e) => {
                self.regions().insert(addr, size);
                Err(e)
            }
        }
    }

    /// Checks `[addr, addr + len)` against the tracked regions.
    pub fn check_range(&self, addr: u64, len: u64) -> Result<()> {
        let transfer_error = |reason: &str| Error::Transfer {
            addr,
            len,
            reason: reason.into(),
            code: libc::EFAULT,
        };

        if addr == 0 {
            return Err(transfer_error("null address"));
        }
        let end = addr.checked_add(len).ok_or_else(|| transfer_error("range wraps around"))?;

        let regions = self.regions();
        if let Some((&start, &size)) = regions.range(..=addr).next_back() {
            let region_end = start + size;
            if addr < region_end && end > region_end {
                return Err(transfer_error("range runs past the end of its allocation"));
            }
        }
        Ok(())
    }

    pub async fn read(&self, dst: &mut [u8], src: u64) -> Result<()> {
        let len = dst.len() as u64;
        self.check_range(src, len)?;

        let bytes = match self.channel.request(None, Command::Read { addr: src, len }).await? {
            Ok(payload) => payload.bytes()?,
            Err(fault) => return Err(Error::Transfer { addr: src, len, reason: fault.message, code: fault.code }),
        };
        if bytes.len() != dst.len() {
            return Err(Error::Protocol(format!("read returned {} bytes, wanted {}", bytes.len(), len)));
        }
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    pub async fn write(&self, dst: u64, src: &[u8]) -> Result<()> {
        let len = src.len() as u64;
        self.check_range(dst, len)?;

        let command = Command::Write { addr: dst, data: src.to_vec() };
        match self.channel.request(None, command).await? {
            Ok(payload) => payload.unit(),
            Err(fault) => Err(Error::Transfer { addr: dst, len, reason: fault.message, code: fault.code }),
        }
    }

    /// Loads a library, or returns the existing handle if `path` is already loaded.
    pub async fn load_library(&self, path: &str) -> Result<LibraryHandle> {
        let mut libraries = self.libraries.lock().await;

        if let Some((handle, _)) = libraries.entries.iter().find(|(_, r)| r.path == path) {
            return Ok(*handle);
        }

        let command = Command::LoadLibrary { path: path.to_string() };
        let module = match self.channel.request(None, command).await? {
            Ok(payload) => payload.word()?,
            Err(fault) => {
                return Err(Error::LibraryLoad { path: path.to_string(), reason: fault.message, code: fault.code });
            }
        };
        if module == 0 {
            return Err(Error::LibraryLoad {
                path: path.to_string(),
                reason: "loader returned a null handle".into(),
                code: libc::ENOEXEC,
            });
        }

        libraries.next += 1;
        let handle = LibraryHandle(libraries.next);
        libraries.entries.insert(handle, LibraryRecord {
            path: path.to_string(),
            module,
            symbols: HashMap::new(),
        });
        tracing::debug!(%handle, path, module, "library loaded");
        Ok(handle)
    }

    pub async fn resolve_symbol(&self, library: LibraryHandle, name: &str) -> Result<u64> {
        let mut libraries = self.libraries.lock().await;
        let record = libraries.entries.get_mut(&library).ok_or(Error::UnknownLibrary(library))?;

        if let Some(addr) = record.symbols.get(name) {
            return Ok(*addr);
        }

        let command = Command::GetSym { module: record.module, name: name.to_string() };
        let not_found = || Error::SymbolNotFound { library, name: name.to_string() };
        let addr = match self.channel.request(None, command).await? {
            Ok(payload) => payload.word()?,
            Err(_) => return Err(not_found()),
        };
        if addr == 0 {
            return Err(not_found());
        }

        record.symbols.insert(name.to_string(), addr);
        Ok(addr)
    }

    pub async fn library_path(&self, library: LibraryHandle) -> Option<String> {
        let libraries = self.libraries.lock().await;
        libraries.entries.get(&library).map(|r| r.path.clone())
    }

    /// Live regions as `(address, size)`, sorted by address.
    pub fn live_regions(&self) -> Vec<(u64, u64)> {
        self.regions().iter().map(|(a, s)| (*a, *s)).collect()
    }

    /// Forgets every region and library.
    pub async fn clear(&self) {
        self.regions().clear();
        self.libraries.lock().await.entries.clear();
    }

    fn regions(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, u64>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn overlaps(regions: &BTreeMap<u64, u64>, addr: u64, size: u64) -> bool {
    let end = addr.saturating_add(size.max(1));
    if let Some((&start, &len)) = regions.range(..=addr).next_back() {
        if start + len.max(1) > addr {
            return true;
        }
    }
    regions.range(addr..end).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_detection() {
        let mut regions = BTreeMap::new();
        regions.insert(0x1000, 0x100);

        assert!(overlaps(&regions, 0x1000, 8));
        assert!(overlaps(&regions, 0x10f8, 16));
        assert!(overlaps(&regions, 0x0ff8, 16));
        assert!(!overlaps(&regions, 0x1100, 8));
        assert!(!overlaps(&regions, 0x0f00, 0x100));
    }
}
