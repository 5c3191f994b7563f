use std::sync::Arc;

use tracing::{trace, warn};
use warren_coordinator::Coordinator;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{ObjectError, Result};

/// Reserved sentinel: "no such key/handle", and the leaf-chain terminator
/// for the B+ tree built on top of this store.
pub const KEY_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

const MAGIC_ID: u64 = 0x5741_5252_454E_3031; // "WARREN01" in ASCII bytes, read as one big-endian u64.

/// Smallest payload a record may hold: enough to carry a free-list "next"
/// pointer once the record is freed.
pub const MIN_RECORD_SIZE: u16 = 8;
/// Largest payload a record may hold: the length prefix is 16 bits.
pub const MAX_RECORD_SIZE: u16 = u16::MAX;

const PREAMBLE_POOLS_OFFSET: u64 = 24;
const POOL_ENTRY_SIZE: u64 = 12;
const ROOT_ENTRY_SIZE: u64 = 16;

/// Tunable limits for an [`ObjectStore`], mirroring spec §6's configuration
/// surface for this subsystem.
#[derive(Clone, Copy)]
pub struct StoreOptions {
    page_size: u64,
    max_pools: u32,
    max_registered: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: warren_storage::DEFAULT_PAGE_SIZE as u64,
            max_pools: 64,
            max_registered: 256,
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, page_size: u64) -> Self {
        assert!(page_size.is_power_of_two());
        self.page_size = page_size;
        self
    }

    pub fn max_pools(mut self, max_pools: u32) -> Self {
        self.max_pools = max_pools;
        self
    }

    pub fn max_registered(mut self, max_registered: u32) -> Self {
        self.max_registered = max_registered;
        self
    }
}

/// A paged allocator of variable-size records above a [`Coordinator`],
/// with a named-root registry on the store's second page (spec §4.5).
///
/// Page 0 holds the preamble (magic, free-space cursor, free-list pools);
/// page 1 holds the named-root table; records start on page 2.
pub struct ObjectStore {
    coordinator: Arc<Coordinator>,
    page_size: u64,
    max_pools: u32,
    max_registered: u32,
}

fn page_of(offset: u64, page_size: u64) -> u64 {
    offset / page_size
}

/// Clamp the requested pool/root limits so both tables fit inside one page
/// each (spec §6: "maximum named roots ... default bounded by page size").
/// A caller-requested limit that wouldn't fit is silently capped rather than
/// failing `create`/`open`, since the preamble layout is the hard invariant.
fn effective_limits(page_size: u64, max_pools: u32, max_registered: u32) -> (u32, u32) {
    let pools_cap = (page_size.saturating_sub(PREAMBLE_POOLS_OFFSET) / POOL_ENTRY_SIZE) as u32;
    let roots_cap = (page_size / ROOT_ENTRY_SIZE) as u32;
    (max_pools.min(pools_cap), max_registered.min(roots_cap))
}

impl ObjectStore {
    /// Initialize a fresh store, overwriting any existing preamble.
    pub fn create(coordinator: Arc<Coordinator>, options: StoreOptions) -> Result<Self> {
        let (max_pools, max_registered) =
            effective_limits(options.page_size, options.max_pools, options.max_registered);
        let store = Self {
            coordinator,
            page_size: options.page_size,
            max_pools,
            max_registered,
        };
        {
            let mut preamble = store.coordinator.get(0, store.page_size, true)?;
            preamble.write_long(MAGIC_ID as i64)?;
            preamble.write_long((2 * store.page_size) as i64)?;
            preamble.write_int(0)?; // pool_count
            preamble.write_int(0)?; // registered_count
        }
        {
            let mut registry = store.coordinator.get(store.page_size, store.page_size, true)?;
            for _ in 0..store.max_registered {
                registry.write_long(0)?;
                registry.write_long(0)?;
            }
        }
        Ok(store)
    }

    /// Open an existing store, validating its preamble magic.
    pub fn open(coordinator: Arc<Coordinator>, options: StoreOptions) -> Result<Self> {
        let (max_pools, max_registered) =
            effective_limits(options.page_size, options.max_pools, options.max_registered);
        let store = Self {
            coordinator,
            page_size: options.page_size,
            max_pools,
            max_registered,
        };
        let mut preamble = store.coordinator.get(0, store.page_size, false)?;
        let magic = preamble.read_long()? as u64;
        if magic != MAGIC_ID {
            return Err(ObjectError::BadMagic { found: magic });
        }
        Ok(store)
    }

    /// Open an existing store, or create one if its preamble is absent
    /// (storage size below one page).
    pub fn open_or_create(coordinator: Arc<Coordinator>, options: StoreOptions) -> Result<Self> {
        if coordinator.storage().size() >= options.page_size {
            Self::open(coordinator, options)
        } else {
            Self::create(coordinator, options)
        }
    }

    /// The coordinator this store allocates records against, for callers
    /// that need a second handle onto the same backing storage (e.g. to
    /// `ObjectStore::open` it again after a root lookup).
    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Number of active free-list size-class pools in the preamble.
    pub fn pool_count(&self) -> Result<u32> {
        let mut preamble = self.coordinator.get(0, self.page_size, false)?;
        preamble.seek(16)?;
        Ok(preamble.read_int()? as u32)
    }

    /// Number of currently-registered named roots, per the preamble's
    /// `registered_count` field.
    pub fn registered_count(&self) -> Result<u32> {
        let mut preamble = self.coordinator.get(0, self.page_size, false)?;
        preamble.seek(20)?;
        Ok(preamble.read_int()? as u32)
    }

    fn bump_registered_count(&self, delta: i32) -> Result<()> {
        let mut preamble = self.coordinator.get(0, self.page_size, true)?;
        preamble.seek(20)?;
        let current = preamble.read_int()?;
        preamble.seek(20)?;
        preamble.write_int(current + delta)?;
        Ok(())
    }

    fn pool_entry_offset(index: u32) -> u64 {
        PREAMBLE_POOLS_OFFSET + index as u64 * POOL_ENTRY_SIZE
    }

    /// Allocate a record of `size` payload bytes, reusing a freed record of
    /// the same size class if one is available.
    pub fn allocate(&self, size: u16) -> Result<u64> {
        let effective = size.max(MIN_RECORD_SIZE);
        if effective > MAX_RECORD_SIZE {
            return Err(ObjectError::TooLarge {
                requested: size as usize,
                max: MAX_RECORD_SIZE as usize,
            });
        }

        let mut preamble = self.coordinator.get(0, self.page_size, true)?;
        preamble.seek(16)?;
        let pool_count = preamble.read_int()? as u32;

        for i in 0..pool_count {
            preamble.seek(Self::pool_entry_offset(i))?;
            let size_class = preamble.read_int()? as u32;
            let head = preamble.read_long()? as u64;
            if size_class == effective as u32 && head != 0 {
                let next = {
                    let mut record = self.coordinator.get(head, 8, false)?;
                    record.read_long()? as u64
                };
                preamble.seek(Self::pool_entry_offset(i) + 4)?;
                preamble.write_long(next as i64)?;
                {
                    let mut record = self.coordinator.get(head - 2, 2, true)?;
                    record.write_char(effective)?;
                }
                trace!(handle = head, size = effective, "object store: reused freed record");
                return Ok(head);
            }
        }
        drop(preamble);
        self.allocate_direct(effective)
    }

    /// Allocate a fresh record from the end of the store, skipping to the
    /// next page if the record would otherwise straddle a page boundary.
    pub fn allocate_direct(&self, size: u16) -> Result<u64> {
        let effective = size.max(MIN_RECORD_SIZE);
        if effective > MAX_RECORD_SIZE {
            return Err(ObjectError::TooLarge {
                requested: size as usize,
                max: MAX_RECORD_SIZE as usize,
            });
        }
        let total = 2u64 + effective as u64;

        let mut preamble = self.coordinator.get(0, self.page_size, true)?;
        preamble.seek(8)?;
        let mut cursor = preamble.read_long()? as u64;
        if page_of(cursor, self.page_size) != page_of(cursor + total - 1, self.page_size) {
            cursor = (page_of(cursor, self.page_size) + 1) * self.page_size;
        }
        let handle = cursor + 2;
        let new_cursor = handle + effective as u64;
        preamble.seek(8)?;
        preamble.write_long(new_cursor as i64)?;
        drop(preamble);

        let mut record = self.coordinator.get(cursor, 2, true)?;
        record.write_char(effective)?;
        trace!(handle, size = effective, "object store: direct allocation");
        Ok(handle)
    }

    /// Free a previously-allocated record, returning it to its size
    /// class's free-list.
    pub fn free(&self, handle: u64) -> Result<()> {
        let len = {
            let mut peek = self.coordinator.get(handle - 2, 2, false)?;
            peek.read_char()?
        };

        let mut preamble = self.coordinator.get(0, self.page_size, true)?;
        preamble.seek(16)?;
        let pool_count = preamble.read_int()? as u32;

        let mut found = None;
        for i in 0..pool_count {
            preamble.seek(Self::pool_entry_offset(i))?;
            let size_class = preamble.read_int()? as u32;
            if size_class == len as u32 {
                found = Some(i);
                break;
            }
        }

        let index = match found {
            Some(i) => i,
            None => {
                if pool_count >= self.max_pools {
                    warn!(handle, size = len, "object store: pool table full, leaking record");
                    return Ok(());
                }
                let i = pool_count;
                preamble.seek(Self::pool_entry_offset(i))?;
                preamble.write_int(len as i32)?;
                preamble.write_long(0)?;
                preamble.seek(16)?;
                preamble.write_int((pool_count + 1) as i32)?;
                i
            }
        };

        preamble.seek(Self::pool_entry_offset(index) + 4)?;
        let old_head = preamble.read_long()? as u64;
        {
            let mut record = self.coordinator.get(handle, 8, true)?;
            record.write_long(old_head as i64)?;
        }
        preamble.seek(Self::pool_entry_offset(index) + 4)?;
        preamble.write_long(handle as i64)?;
        trace!(handle, size = len, "object store: freed record");
        Ok(())
    }

    /// Acquire a bounded access over a record's payload bytes.
    pub fn access(&self, handle: u64, writable: bool) -> Result<warren_coordinator::CoordinatedAccess<'_>> {
        let len = {
            let mut peek = self.coordinator.get(handle - 2, 2, false)?;
            peek.read_char()?
        };
        Ok(self.coordinator.get(handle, len as u64, writable)?)
    }

    fn hash_name(name: &str) -> u64 {
        xxh3_64(name.as_bytes())
    }

    fn root_entry_offset(index: u32) -> u64 {
        index as u64 * ROOT_ENTRY_SIZE
    }

    /// Register `handle` under `name`. Fails if the registry is full.
    pub fn register(&self, name: &str, handle: u64) -> Result<()> {
        let hash = Self::hash_name(name);
        let mut registry = self.coordinator.get(self.page_size, self.page_size, true)?;
        for i in 0..self.max_registered {
            registry.seek(Self::root_entry_offset(i))?;
            let _existing_hash = registry.read_long()?;
            let existing_handle = registry.read_long()? as u64;
            if existing_handle == 0 {
                registry.seek(Self::root_entry_offset(i))?;
                registry.write_long(hash as i64)?;
                registry.write_long(handle as i64)?;
                drop(registry);
                self.bump_registered_count(1)?;
                return Ok(());
            }
        }
        Err(ObjectError::RegistryFull {
            max: self.max_registered as usize,
        })
    }

    /// Remove the registry entry for `name`, if present.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let hash = Self::hash_name(name);
        let mut registry = self.coordinator.get(self.page_size, self.page_size, true)?;
        for i in 0..self.max_registered {
            registry.seek(Self::root_entry_offset(i))?;
            let existing_hash = registry.read_long()? as u64;
            let existing_handle = registry.read_long()? as u64;
            if existing_handle != 0 && existing_hash == hash {
                registry.seek(Self::root_entry_offset(i))?;
                registry.write_long(0)?;
                registry.write_long(0)?;
                drop(registry);
                self.bump_registered_count(-1)?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Look up the handle registered under `name`, or [`KEY_NULL`].
    pub fn get_object(&self, name: &str) -> Result<u64> {
        let hash = Self::hash_name(name);
        let mut registry = self.coordinator.get(self.page_size, self.page_size, false)?;
        for i in 0..self.max_registered {
            registry.seek(Self::root_entry_offset(i))?;
            let existing_hash = registry.read_long()? as u64;
            let existing_handle = registry.read_long()? as u64;
            if existing_handle != 0 && existing_hash == hash {
                return Ok(existing_handle);
            }
        }
        Ok(KEY_NULL)
    }

    /// Enumerate every registered `(name_hash, handle)` pair.
    pub fn list_roots(&self) -> Result<Vec<(u64, u64)>> {
        let mut registry = self.coordinator.get(self.page_size, self.page_size, false)?;
        let mut out = Vec::new();
        for i in 0..self.max_registered {
            registry.seek(Self::root_entry_offset(i))?;
            let hash = registry.read_long()? as u64;
            let handle = registry.read_long()? as u64;
            if handle != 0 {
                out.push((hash, handle));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warren_storage::backend::InMemoryStorage;
    use warren_storage::Storage;

    fn store() -> ObjectStore {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let coordinator = Arc::new(Coordinator::new(storage, 64, 16));
        ObjectStore::create(coordinator, StoreOptions::new().page_size(512)).unwrap()
    }

    #[test]
    fn allocate_then_access_round_trips_payload() {
        let store = store();
        let handle = store.allocate(16).unwrap();
        {
            let mut access = store.access(handle, true).unwrap();
            access.write_long(0x1122_3344_5566_7788).unwrap();
        }
        let mut access = store.access(handle, false).unwrap();
        assert_eq!(access.read_long().unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn free_then_reallocate_reuses_handle_lifo() {
        let store = store();
        let a = store.allocate(8).unwrap();
        let b = store.allocate(8).unwrap();
        store.free(a).unwrap();
        store.free(b).unwrap();
        let reused1 = store.allocate(8).unwrap();
        let reused2 = store.allocate(8).unwrap();
        assert_eq!(reused1, b);
        assert_eq!(reused2, a);
    }

    #[test]
    fn register_and_look_up_named_root() {
        let store = store();
        let handle = store.allocate(8).unwrap();
        store.register("root", handle).unwrap();
        assert_eq!(store.get_object("root").unwrap(), handle);
        store.unregister("root").unwrap();
        assert_eq!(store.get_object("root").unwrap(), KEY_NULL);
    }

    #[test]
    fn registered_count_tracks_live_roots() {
        let store = store();
        assert_eq!(store.registered_count().unwrap(), 0);
        let a = store.allocate(8).unwrap();
        let b = store.allocate(8).unwrap();
        store.register("a", a).unwrap();
        store.register("b", b).unwrap();
        assert_eq!(store.registered_count().unwrap(), 2);
        assert_eq!(store.list_roots().unwrap().len(), 2);
        store.unregister("a").unwrap();
        assert_eq!(store.registered_count().unwrap(), 1);
    }
}
