use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Sentinel next-index meaning "end of list" / "no such slot".
pub(crate) const NIL: u8 = u8::MAX;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Free = 0,
    Active = 1,
    LogicallyRemoved = 2,
    Returning = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Free,
            1 => Phase::Active,
            2 => Phase::LogicallyRemoved,
            _ => Phase::Returning,
        }
    }
}

/// Packed control word: `[unused:32][touching:16][next:8][phase:8]`.
///
/// The full 64-bit location/length live in their own fields (see the
/// module-level doc in `lib.rs` for why); this word only carries the
/// lock-free list machinery.
fn pack(phase: u8, next: u8, touching: u16) -> u64 {
    (phase as u64) | ((next as u64) << 8) | ((touching as u64) << 16)
}

fn unpack(word: u64) -> (u8, u8, u16) {
    (word as u8, (word >> 8) as u8, (word >> 16) as u16)
}

/// One pooled slot in the coordinator's admission list.
pub(crate) struct Slot {
    state: AtomicU64,
    key: AtomicU64,
    length: AtomicU64,
    writable: AtomicU8,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(Phase::Free as u8, NIL, 0)),
            key: AtomicU64::new(0),
            length: AtomicU64::new(0),
            writable: AtomicU8::new(0),
        }
    }

    /// Atomically claim this slot if it is free. Returns `true` on success;
    /// the caller must call [`Slot::publish`] before anyone else observes
    /// the slot as linked into the list.
    pub(crate) fn try_claim(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        let (phase, next, touching) = unpack(current);
        if Phase::from_u8(phase) != Phase::Free {
            return false;
        }
        let desired = pack(Phase::Active as u8, next, touching);
        self.state
            .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Write the access's range into a claimed slot. Plain stores: the
    /// subsequent `compare_exchange` that links the slot into the list acts
    /// as the release that publishes these fields to other threads.
    pub(crate) fn publish(&self, location: u64, length: u64, writable: bool) {
        self.key.store(location, Ordering::Relaxed);
        self.length.store(length, Ordering::Relaxed);
        self.writable.store(writable as u8, Ordering::Relaxed);
    }

    /// The slot's `(location, length, writable)` if it is currently active.
    pub(crate) fn published_range(&self) -> Option<(u64, u64, bool)> {
        let (phase, _, _) = unpack(self.state.load(Ordering::Acquire));
        if Phase::from_u8(phase) != Phase::Active {
            return None;
        }
        Some((
            self.key.load(Ordering::Relaxed),
            self.length.load(Ordering::Relaxed),
            self.writable.load(Ordering::Relaxed) != 0,
        ))
    }

    pub(crate) fn next(&self) -> u8 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    pub(crate) fn set_next(&self, next: u8) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (phase, _, touching) = unpack(current);
            let desired = pack(phase, next, touching);
            match self.state.compare_exchange_weak(current, desired, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// CAS this slot's `next` field from `expected` to `new`.
    pub(crate) fn cas_next(&self, expected: u8, new: u8) -> bool {
        let current = self.state.load(Ordering::Acquire);
        let (phase, next, touching) = unpack(current);
        if next != expected {
            return false;
        }
        let desired = pack(phase, new, touching);
        self.state
            .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Abort a failed insertion attempt: return the slot to `Free`
    /// immediately (no one else has observed it as linked).
    pub(crate) fn free(&self) {
        let current = self.state.load(Ordering::Acquire);
        let (_, next, touching) = unpack(current);
        self.state.store(pack(Phase::Free as u8, next, touching), Ordering::Release);
    }

    /// CAS `Active -> LogicallyRemoved`. Returns `false` if another remover
    /// already won.
    pub(crate) fn begin_remove(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        let (phase, next, touching) = unpack(current);
        if Phase::from_u8(phase) != Phase::Active {
            return false;
        }
        let desired = pack(Phase::LogicallyRemoved as u8, next, touching);
        self.state
            .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record the hazard mask captured at removal time and move to
    /// `Returning`.
    pub(crate) fn begin_returning(&self, touching_threads: u16) {
        let current = self.state.load(Ordering::Acquire);
        let (_, next, _) = unpack(current);
        self.state
            .store(pack(Phase::Returning as u8, next, touching_threads), Ordering::Release);
    }

    /// Clear `thread_bit` from this slot's touching mask if it is
    /// `Returning`; free it once the mask reaches zero.
    pub(crate) fn clear_touching_bit(&self, thread_bit: u16) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (phase, next, touching) = unpack(current);
            if Phase::from_u8(phase) != Phase::Returning || touching & thread_bit == 0 {
                return;
            }
            let remaining = touching & !thread_bit;
            let new_phase = if remaining == 0 { Phase::Free as u8 } else { Phase::Returning as u8 };
            let desired = pack(new_phase, next, remaining);
            if self
                .state
                .compare_exchange_weak(current, desired, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Free this node immediately if it entered `Returning` with an empty
    /// hazard mask (no thread was walking at removal time).
    pub(crate) fn reclaim_if_dry(&self) {
        let current = self.state.load(Ordering::Acquire);
        let (phase, next, touching) = unpack(current);
        if Phase::from_u8(phase) == Phase::Returning && touching == 0 {
            let desired = pack(Phase::Free as u8, next, 0);
            let _ = self.state.compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}
