//! End-to-end scenarios from spec §8.

use std::sync::Arc;

use warren_coordinator::Coordinator;
use warren_objects::{ObjectStore, StoreOptions};
use warren_storage::backend::InMemoryStorage;
use warren_storage::Storage;

fn store() -> ObjectStore {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(Coordinator::new(storage, 64, 16));
    ObjectStore::create(coordinator, StoreOptions::new()).unwrap()
}

/// S3 — object store reuse: allocate sizes 8/16/32, free them, allocate the
/// same sizes again, and confirm LIFO reuse with a bounded pool count.
#[test]
fn s3_object_store_reuse() {
    let store = store();
    let sizes = [8u16, 16, 32];
    let handles: Vec<u64> = sizes.iter().map(|&s| store.allocate(s).unwrap()).collect();
    for &h in &handles {
        store.free(h).unwrap();
    }
    let reallocated: Vec<u64> = sizes.iter().map(|&s| store.allocate(s).unwrap()).collect();
    assert_eq!(reallocated, handles);
    assert!(store.pool_count().unwrap() <= 3);
}
