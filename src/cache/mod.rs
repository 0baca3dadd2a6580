//! Bucketed response cache for offline support.
//!
//! This module provides the storage side of the offline cache:
//! - Named buckets mapping a request identity (method + URL) to a response
//! - An explicit `CacheStorage` interface so hosts can inject their own store
//! - SQLite, in-memory and no-op backends

mod memory;
mod storage;
mod traits;

pub use memory::MemoryStorage;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{
  CacheSource, CachedResponse, Destination, FetchResponse, Request, RequestKey, Response,
};
