//! End-to-end scenarios from spec §8.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use warren_coordinator::Coordinator;
use warren_storage::backend::InMemoryStorage;
use warren_storage::Storage;

/// S2 — concurrent-access manager stress. The spec's own figures (16 threads
/// x 65536 iterations) are scaled down to keep the suite fast; the shape of
/// the stress — many threads hammering overlapping random ranges with a mix
/// of readers and writers, each access immediately closed — is unchanged.
#[test]
fn s2_concurrent_access_stress() {
    const THREADS: u64 = 16;
    const ITERATIONS: u64 = 4000;

    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(Coordinator::new(storage, 64, 16));
    let completed = Arc::new(AtomicU32::new(0));

    thread::scope(|scope| {
        for t in 0..THREADS {
            let coordinator = coordinator.clone();
            let completed = completed.clone();
            scope.spawn(move || {
                // A small xorshift so each thread gets an independent,
                // deterministic pseudo-random sequence without pulling in a
                // `rand` dependency for one test.
                let mut state = 0x9E3779B9u64 ^ (t.wrapping_mul(0x2545F4914F6CDD1D) + 1);
                let mut next = move || {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state
                };
                for _ in 0..ITERATIONS {
                    let loc = next() % 65536;
                    let len = (next() % 255) + 1;
                    let writable = next() % 2 == 0;
                    let access = coordinator.get(loc, len, writable).unwrap();
                    assert_eq!(access.location(), loc);
                    assert_eq!(access.length(), len);
                    assert_eq!(access.is_writable(), writable);
                    drop(access);
                    completed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(completed.load(Ordering::Relaxed) as u64, THREADS * ITERATIONS);
}
