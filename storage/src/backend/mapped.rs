use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::MmapRaw;

use crate::access::Storage;
use crate::cell::RacyCell;
use crate::endpoint::{Endpoint, PageBacking};
use crate::error::{Error, Result};

/// Doubling growth, floored at one OS page, matches the teacher's own
/// `StorageInner::expand` heuristic for how far ahead of a requested offset
/// to map.
fn next_capacity(current: u64, required: u64) -> u64 {
    let page = page_size::get() as u64;
    let mut cap = current.max(page);
    while cap < required {
        cap = cap.saturating_mul(2);
    }
    cap
}

struct MappedBacking {
    map: MmapRaw,
}

// Safety: `MmapRaw` points at OS-managed memory; the aliasing rules that
// matter are the ones the Access Coordinator enforces, not anything the
// mapping itself needs.
unsafe impl Send for MappedBacking {}
unsafe impl Sync for MappedBacking {}

impl PageBacking for MappedBacking {
    unsafe fn bytes(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), self.map.len()) }
    }
}

/// A single memory-mapped file (spec §4.3's "Mapped File" variant).
///
/// Growing the mapping never drops the old one: callers may be holding
/// [`Endpoint`]s that reference it, so the old `Arc<MappedBacking>` is simply
/// left to die once its last `Endpoint` does. `size` reports the full extent
/// reachable through the mapping (spec §4.3: "bounds are `[0, file_size)`"),
/// which may run ahead of what was actually written since growth
/// over-allocates; `truncate` still sets `size` to the exact requested value,
/// so it only ever moves backward via an explicit call.
pub struct MappedFileStorage {
    file: Mutex<File>,
    current: Mutex<Arc<MappedBacking>>,
    size: AtomicU64,
    writable: bool,
}

impl MappedFileStorage {
    /// Open `path`, creating it if it doesn't already exist (same
    /// create-if-missing convenience as [`crate::backend::BufferedFileStorage::open_path`]).
    pub fn open_path(path: impl AsRef<std::path::Path>, writable: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;
        Self::open(file, writable)
    }

    pub fn open(file: File, writable: bool) -> Result<Self> {
        use fs4::fs_std::FileExt;
        if writable {
            file.try_lock_exclusive().map_err(Error::Lock)?;
        }
        let metadata = file.metadata().map_err(Error::Open)?;
        let size = metadata.len();
        let initial_cap = next_capacity(0, size.max(1));
        file.set_len(initial_cap).map_err(|source| Error::ResizeFailed {
            current: size,
            requested: initial_cap,
            source,
        })?;
        let map = MmapRaw::map_raw(&file).map_err(|source| Error::MapFailed {
            requested: initial_cap as usize,
            source,
        })?;
        Ok(Self {
            file: Mutex::new(file),
            current: Mutex::new(Arc::new(MappedBacking { map })),
            size: AtomicU64::new(size),
            writable,
        })
    }

    fn grow_to(&self, required: u64) -> Result<Arc<MappedBacking>> {
        let mut current = self.current.lock().unwrap();
        if current.map.len() as u64 >= required {
            return Ok(current.clone());
        }
        let file = self.file.lock().unwrap();
        let new_cap = next_capacity(current.map.len() as u64, required);
        file.set_len(new_cap).map_err(|source| Error::ResizeFailed {
            current: current.map.len() as u64,
            requested: new_cap,
            source,
        })?;
        let map = MmapRaw::map_raw(&*file).map_err(|source| Error::MapFailed {
            requested: new_cap as usize,
            source,
        })?;
        let fresh = Arc::new(MappedBacking { map });
        *current = fresh.clone();
        Ok(fresh)
    }
}

impl Storage for MappedFileStorage {
    fn is_writable(&self) -> bool {
        self.writable
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        let current = self.current.lock().unwrap();
        current.map.flush().map_err(Error::Sync)
    }

    fn truncate(&self, new_size: u64) -> Result<bool> {
        if new_size >= self.size() {
            return Ok(false);
        }
        self.size.store(new_size, Ordering::Release);
        let current = self.current.lock().unwrap();
        let bytes = unsafe { current.bytes() };
        if (new_size as usize) < bytes.len() {
            bytes[new_size as usize..].fill(0);
        }
        Ok(true)
    }

    fn acquire_endpoint_at(&self, index: u64, writable: bool) -> Result<Endpoint> {
        if writable && !self.writable {
            return Err(Error::OutOfBounds {
                offset: index,
                len: 0,
                size: self.size(),
            });
        }
        let required = index.checked_add(1).ok_or(Error::OutOfBounds {
            offset: index,
            len: 1,
            size: self.size(),
        })?;
        let backing = if (self.current.lock().unwrap().map.len() as u64) < required {
            self.grow_to(required)?
        } else {
            self.current.lock().unwrap().clone()
        };
        let upper = backing.map.len() as u64;
        // The endpoint below grants access to the whole mapping, not just
        // `index`, so the reported size must track that full reach (mirrors
        // how the in-memory and buffered backends bump `size` to their whole
        // page, not just the touched offset). Tracking only `index + 1` would
        // under-report size for any write that lands beyond the single index
        // this call was made for.
        if upper > self.size.load(Ordering::Acquire) {
            self.size.store(upper, Ordering::Release);
        }
        Ok(Endpoint::new(0, upper, writable, backing))
    }

    fn release_endpoint(&self, _endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Access;

    #[test]
    fn open_path_creates_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.db");
        assert!(!path.exists());
        let storage: Arc<dyn Storage> = Arc::new(MappedFileStorage::open_path(&path, true).unwrap());
        let mut access = Access::new(storage, 0, 8, true);
        access.write_long(1).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn grows_the_mapping_on_demand() {
        let file = tempfile::tempfile().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MappedFileStorage::open(file, true).unwrap());
        let mut access = Access::new(storage.clone(), 1_000_000, 8, true);
        access.write_long(7).unwrap();
        access.reset();
        assert_eq!(access.read_long().unwrap(), 7);
    }

    #[test]
    fn read_only_storage_rejects_writes() {
        let file = tempfile::tempfile().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MappedFileStorage::open(file, false).unwrap());
        let mut access = Access::new(storage, 0, 8, true);
        assert!(access.write_long(1).is_err());
    }
}
