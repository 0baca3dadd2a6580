//! Manifest-driven offline cache.
//!
//! An [`OfflineCacheManager`] owns one bucket named after a hash of its
//! [`Manifest`]. Install fills the bucket from the manifest, activate deletes
//! every other bucket, and fetch interception serves from the bucket before
//! going to the network.

pub mod cache;
pub mod config;
pub mod manifest;
pub mod network;
pub mod worker;

pub use cache::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use config::Config;
pub use manifest::{Manifest, ManifestEntry};
pub use network::{HttpNetwork, Network};
pub use worker::{InstallOutcome, OfflineCacheManager, SyncOutcome, WorkerState};
