//! A paged record allocator ([`ObjectStore`]) and a persistent `u64 -> u64`
//! [`BTree`] built on top of it (spec §4.5, §4.6).
//!
//! Both live above a [`warren_coordinator::Coordinator`], which is what
//! makes sharing an [`ObjectStore`] or [`BTree`] across threads sound: every
//! record access goes through the coordinator's admission list, so two
//! threads never observe a torn write to the same record.

mod btree;
mod error;
mod store;

pub use btree::{BTree, BTreeIter, BTreeOptions, DEFAULT_RATE};
pub use error::{BTreeError, BTreeResult, ObjectError, Result};
pub use store::{ObjectStore, StoreOptions, KEY_NULL, MAX_RECORD_SIZE, MIN_RECORD_SIZE};
