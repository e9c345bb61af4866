//! Local persistence: the key-value storage layer and the record cache on top of it.
//!
//! This module provides:
//! - A small `Storage` trait (get/put/delete/list per named collection)
//! - SQLite and in-memory backends
//! - The local record store used for optimistic, network-free reads

mod records;
mod storage;
mod traits;

pub use records::{CachedRecord, RecordStore};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
#[cfg(test)]
pub(crate) use storage::FailingStorage;
pub use traits::{CacheResult, CacheSource};
