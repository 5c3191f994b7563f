use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::access::Storage;
use crate::cell::RacyCell;
use crate::endpoint::{Endpoint, PageBacking};
use crate::error::{Error, Result};

const DEFAULT_PAGE_SIZE: u64 = 8192;

struct MemPage(RacyCell<Box<[u8]>>);

impl PageBacking for MemPage {
    unsafe fn bytes(&self) -> &mut [u8] {
        unsafe { &mut *self.0.get() }
    }
}

/// A growable byte array composed of fixed-size pages, held entirely in
/// process memory (spec §4.3's "In-Memory" variant).
pub struct InMemoryStorage {
    page_size: u64,
    pages: Mutex<Vec<Arc<MemPage>>>,
    size: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: u64) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self {
            page_size,
            pages: Mutex::new(Vec::new()),
            size: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn page_index(&self, absolute: u64) -> u64 {
        absolute / self.page_size
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for InMemoryStorage {
    fn is_writable(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        // Nothing is backed by disk; there is nothing to persist.
        Ok(())
    }

    fn truncate(&self, new_size: u64) -> Result<bool> {
        if new_size >= self.size() {
            return Ok(false);
        }
        let mut pages = self.pages.lock().unwrap();
        let keep_pages = new_size.div_ceil(self.page_size) as usize;
        if keep_pages < pages.len() {
            pages.truncate(keep_pages);
        }
        // Zero any bytes beyond the new size in the last retained page, so a
        // later grow-back-into-this-page doesn't resurrect stale data.
        if new_size % self.page_size != 0 {
            if let Some(page) = pages.last() {
                let start = (new_size % self.page_size) as usize;
                unsafe { page.bytes()[start..].fill(0) };
            }
        }
        self.size.store(new_size, Ordering::Release);
        Ok(true)
    }

    fn acquire_endpoint_at(&self, index: u64, writable: bool) -> Result<Endpoint> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        let page_idx = self.page_index(index) as usize;
        let mut pages = self.pages.lock().unwrap();
        while pages.len() <= page_idx {
            pages.push(Arc::new(MemPage(RacyCell::new(
                vec![0u8; self.page_size as usize].into_boxed_slice(),
            ))));
        }
        let page_start = page_idx as u64 * self.page_size;
        let new_size = page_start + self.page_size;
        if new_size > self.size.load(Ordering::Acquire) {
            self.size.store(new_size, Ordering::Release);
        }
        let backing = pages[page_idx].clone();
        Ok(Endpoint::new(page_start, page_start + self.page_size, writable, backing))
    }

    fn release_endpoint(&self, _endpoint: Endpoint) -> Result<()> {
        // Pages are owned for the lifetime of the storage; nothing to do.
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Access;

    #[test]
    fn grows_as_pages_are_touched() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::with_page_size(64));
        let mut access = Access::new(storage.clone(), 100, 8, true);
        access.write_long(0x0102030405060708).unwrap();
        assert!(storage.size() >= 108);
    }

    #[test]
    fn read_write_round_trip_across_pages() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::with_page_size(16));
        let mut access = Access::new(storage.clone(), 12, 8, true);
        access.write_long(-1).unwrap();
        access.reset();
        assert_eq!(access.read_long().unwrap(), -1);
    }

    #[test]
    fn truncate_shrinks_size_and_blocks_reads_past_it() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::with_page_size(64));
        {
            let mut access = Access::new(storage.clone(), 0, 128, true);
            access.write_byte_array(&[7u8; 128]).unwrap();
        }
        assert!(storage.truncate(64).unwrap());
        assert_eq!(storage.size(), 64);
        let mut access = Access::new(storage.clone(), 60, 8, false);
        assert!(access.read_long().is_err());
    }
}
