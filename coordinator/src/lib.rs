//! The thread-safe Access Coordinator (spec §4.4): wraps a [`warren_storage::Storage`]
//! and admits [`warren_storage::Access`]es through a lock-free, sorted singly-linked
//! list of active access records, so that overlapping writers are serialized
//! without blocking disjoint accesses.
//!
//! # Design note on the packed slot word
//!
//! The source this is modeled on packs a 32-bit key into the same word as
//! phase/next/touching-threads. That caps addressable locations at 2^32.
//! Per the explicit license to "redesign the packed layout to match" a wider
//! identifier, the key (the full 64-bit `location`) lives in its own atomic
//! field; the packed [`SlotState`] word carries only phase, next-index, and
//! the touching-threads bitmap. The key field is published with the same
//! release/acquire pair that publishes the slot's phase, so readers that
//! observe `Phase::Active` always see a consistent key/length/writable.

mod error;
mod slot;

pub use error::{CoordinatorError, Result};

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::trace;
use warren_storage::{Access, Storage};

use slot::{Slot, NIL};

/// Default number of pooled access slots (spec §6).
pub const DEFAULT_MAX_SLOTS: usize = 64;
/// Default width of the thread-identifier pool (spec §6).
pub const DEFAULT_MAX_THREADS: u8 = 16;

/// Builder for [`Coordinator`] (mirrors the teacher's `OpenOptions` shape).
pub struct CoordinatorOptions {
    max_slots: usize,
    max_threads: u8,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_slots: DEFAULT_MAX_SLOTS,
            max_threads: DEFAULT_MAX_THREADS,
        }
    }
}

impl CoordinatorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots;
        self
    }

    pub fn max_threads(mut self, max_threads: u8) -> Self {
        assert!(max_threads <= 16, "thread-identifier pool is 16 bits wide");
        self.max_threads = max_threads;
        self
    }

    pub fn build(self, storage: Arc<dyn Storage>) -> Coordinator {
        Coordinator::new(storage, self.max_slots, self.max_threads)
    }
}

/// Sentinel written to `accesses_threads` while a removal is capturing the
/// set of in-flight walkers; spec calls this the "locked" mask value.
const THREADS_LOCKED: u16 = u16::MAX;

/// A lock-free admission list sitting in front of a [`Storage`].
///
/// Every access acquired through [`Coordinator::get`] is guaranteed disjoint
/// from every other simultaneously-live writable access (spec §4.4's mutual
/// exclusion invariant). Reads never block other reads, and disjoint ranges
/// never block each other regardless of writability.
pub struct Coordinator {
    storage: Arc<dyn Storage>,
    slots: Vec<Slot>,
    head: AtomicU8,
    thread_pool: AtomicU16,
    accesses_threads: AtomicU16,
}

impl Coordinator {
    pub fn new(storage: Arc<dyn Storage>, max_slots: usize, max_threads: u8) -> Self {
        assert!(max_slots <= 254, "next-index is an 8-bit field; NIL=255 is reserved");
        assert!(max_threads <= 16);
        let slots = (0..max_slots).map(|_| Slot::new()).collect();
        Self {
            storage,
            slots,
            head: AtomicU8::new(NIL),
            thread_pool: AtomicU16::new(0),
            accesses_threads: AtomicU16::new(0),
        }
    }

    pub fn with_options(storage: Arc<dyn Storage>, options: CoordinatorOptions) -> Self {
        options.build(storage)
    }

    /// The underlying storage this coordinator admits accesses against.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn acquire_thread_id(&self) -> u8 {
        loop {
            let current = self.thread_pool.load(Ordering::Acquire);
            let free = (!current).trailing_zeros();
            if free >= 16 {
                std::hint::spin_loop();
                continue;
            }
            let bit = 1u16 << free;
            if self
                .thread_pool
                .compare_exchange_weak(current, current | bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return free as u8;
            }
        }
    }

    fn release_thread_id(&self, id: u8) {
        self.thread_pool.fetch_and(!(1u16 << id), Ordering::Release);
    }

    /// Register `id` as "currently walking the list" unless a removal has
    /// temporarily locked the mask, in which case spin until it unlocks.
    fn enter_walk(&self, id: u8) {
        let bit = 1u16 << id;
        loop {
            let current = self.accesses_threads.load(Ordering::Acquire);
            if current == THREADS_LOCKED {
                std::hint::spin_loop();
                continue;
            }
            if self
                .accesses_threads
                .compare_exchange_weak(current, current | bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// End of a list walk: clear our touching bit everywhere, reclaiming any
    /// `Returning` node whose touching mask drops to zero, then clear our
    /// presence bit in the global mask.
    fn exit_walk(&self, id: u8) {
        let bit = 1u16 << id;
        for slot in &self.slots {
            slot.clear_touching_bit(bit);
        }
        loop {
            let current = self.accesses_threads.load(Ordering::Acquire);
            if current == THREADS_LOCKED {
                std::hint::spin_loop();
                continue;
            }
            if self
                .accesses_threads
                .compare_exchange_weak(current, current & !bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.try_claim())
    }

    /// Walk the sorted list, returning `(left, right)` slot indices such that
    /// `left` is the last node with `key < location` and `right` is the
    /// first node with `key >= location`. Also returns whether any visited
    /// node overlapping `[location, location+length)` conflicts (shares a
    /// writable side).
    fn scan(&self, location: u64, length: u64, writable: bool) -> ScanResult {
        let mut left: Option<u8> = None;
        let mut cur = self.head.load(Ordering::Acquire);
        let mut conflict = false;
        while cur != NIL {
            let slot = &self.slots[cur as usize];
            let Some((key, slot_len, slot_writable)) = slot.published_range() else {
                // This slot isn't Active (a remover got to it: it's
                // LogicallyRemoved, Returning, or already Free). Following its
                // `next` anyway is still sound: `enter_walk()` recorded our
                // thread's bit in `accesses_threads` before this walk began,
                // and a remover unlinks the node from the list first and only
                // afterward snapshots `accesses_threads` into the node's
                // hazard mask (`begin_returning`). So any removal racing with
                // our walk either finished unlinking before we read this
                // slot's `next` pointer here (in which case the pointer we
                // read is stale only in the sense that the node is no longer
                // reachable from the head — its `next` is still the same link
                // that was valid while it was in the list), or it captured
                // our bit in its hazard mask and therefore can't reach Free
                // until we call `exit_walk()`, which hasn't happened yet. A
                // node's `next` field is never mutated once it starts
                // returning, so it's safe to keep following regardless of
                // which case applies.
                cur = slot.next();
                continue;
            };
            if key < location {
                left = Some(cur);
            }
            let overlaps = ranges_overlap(location, length, key, slot_len);
            if overlaps && (writable || slot_writable) {
                conflict = true;
            }
            if key >= location + length {
                break;
            }
            cur = slot.next();
        }
        let right = left.map(|l| self.slots[l as usize].next()).unwrap_or_else(|| self.head.load(Ordering::Acquire));
        ScanResult { left, right, conflict }
    }

    /// Admit a new access over `[location, location+length)` (spec §4.4's
    /// insert protocol). Blocks (spins) while an overlapping writable access
    /// is live, and while the slot pool is momentarily exhausted.
    pub fn get(&self, location: u64, length: u64, writable: bool) -> Result<CoordinatedAccess<'_>> {
        location.checked_add(length).ok_or(CoordinatorError::RangeOverflow { location, length })?;

        let thread_id = self.acquire_thread_id();
        let result = self.get_inner(location, length, writable, thread_id);
        self.release_thread_id(thread_id);
        result
    }

    fn get_inner(&self, location: u64, length: u64, writable: bool, thread_id: u8) -> Result<CoordinatedAccess<'_>> {
        loop {
            let Some(my) = self.find_free_slot() else {
                std::hint::spin_loop();
                continue;
            };
            self.slots[my].publish(location, length, writable);

            self.enter_walk(thread_id);
            let scan = self.scan(location, length, writable);
            if scan.conflict {
                self.exit_walk(thread_id);
                self.slots[my].free();
                trace!(location, length, writable, "coordinator: overlap, retrying insert");
                continue;
            }

            let my_idx = my as u8;
            self.slots[my].set_next(scan.right);
            let linked = match scan.left {
                None => self
                    .head
                    .compare_exchange(scan.right, my_idx, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok(),
                Some(l) => self.slots[l as usize].cas_next(scan.right, my_idx),
            };
            self.exit_walk(thread_id);

            if !linked {
                self.slots[my].free();
                continue;
            }

            let inner = Access::new(self.storage.clone(), location, length, writable);
            return Ok(CoordinatedAccess {
                coordinator: self,
                slot: my,
                inner: Some(inner),
            });
        }
    }

    fn remove(&self, slot_idx: usize) {
        let slot = &self.slots[slot_idx];
        if !slot.begin_remove() {
            return;
        }
        // Unlink: find predecessor by a linear walk from head (spec: "find
        // the node in the list (linear)").
        let target = slot_idx as u8;
        loop {
            let mut prev: Option<u8> = None;
            let mut cur = self.head.load(Ordering::Acquire);
            while cur != NIL && cur != target {
                prev = Some(cur);
                cur = self.slots[cur as usize].next();
            }
            if cur != target {
                // Already unlinked by a racing remover.
                break;
            }
            let next = slot.next();
            let bypassed = match prev {
                None => self.head.compare_exchange(target, next, Ordering::AcqRel, Ordering::Acquire).is_ok(),
                Some(p) => self.slots[p as usize].cas_next(target, next),
            };
            if bypassed {
                break;
            }
        }

        // Capture the set of threads currently mid-walk, hand it to the node
        // as its hazard mask, and mark it returning.
        loop {
            let current = self.accesses_threads.load(Ordering::Acquire);
            if current == THREADS_LOCKED {
                std::hint::spin_loop();
                continue;
            }
            if self
                .accesses_threads
                .compare_exchange(current, THREADS_LOCKED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.begin_returning(current);
                self.accesses_threads.store(current, Ordering::Release);
                break;
            }
        }
        // If nobody was walking, the node is immediately reclaimable.
        slot.reclaim_if_dry();
    }
}

struct ScanResult {
    left: Option<u8>,
    right: u8,
    conflict: bool,
}

fn ranges_overlap(a_loc: u64, a_len: u64, b_loc: u64, b_len: u64) -> bool {
    a_loc < b_loc.saturating_add(b_len) && b_loc < a_loc.saturating_add(a_len)
}

/// A [`warren_storage::Access`] admitted through the coordinator. Dropping
/// it runs the removal protocol before the inner access closes.
pub struct CoordinatedAccess<'a> {
    coordinator: &'a Coordinator,
    slot: usize,
    inner: Option<Access>,
}

impl std::ops::Deref for CoordinatedAccess<'_> {
    type Target = Access;
    fn deref(&self) -> &Access {
        self.inner.as_ref().expect("inner access dropped exactly once")
    }
}

impl std::ops::DerefMut for CoordinatedAccess<'_> {
    fn deref_mut(&mut self) -> &mut Access {
        self.inner.as_mut().expect("inner access dropped exactly once")
    }
}

impl Drop for CoordinatedAccess<'_> {
    fn drop(&mut self) {
        self.inner.take();
        self.coordinator.remove(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warren_storage::backend::InMemoryStorage;

    fn coordinator() -> Coordinator {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        Coordinator::new(storage, 64, 16)
    }

    #[test]
    fn disjoint_accesses_both_admit() {
        let c = coordinator();
        let a = c.get(0, 16, true).unwrap();
        let b = c.get(100, 16, true).unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn sequential_overlapping_writes_both_eventually_succeed() {
        let c = coordinator();
        {
            let _a = c.get(0, 16, true).unwrap();
        }
        let _b = c.get(8, 16, true).unwrap();
    }

    #[test]
    fn concurrent_disjoint_and_overlapping_stress() {
        use std::thread;
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let coordinator = Arc::new(Coordinator::new(storage, 64, 8));
        thread::scope(|scope| {
            for t in 0..8 {
                let coordinator = coordinator.clone();
                scope.spawn(move || {
                    for i in 0..200u64 {
                        let loc = (t as u64 * 37 + i) % 64;
                        let access = coordinator.get(loc, 8, i % 2 == 0).unwrap();
                        drop(access);
                    }
                });
            }
        });
    }
}
