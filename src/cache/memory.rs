//! In-memory cache storage.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::storage::{ensure_cacheable, CacheStorage};
use super::traits::{CachedResponse, RequestKey, Response};

type Bucket = BTreeMap<RequestKey, CachedResponse>;

/// Cache storage held entirely in process memory.
///
/// Used by tests and by hosts that embed the manager without persistence.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  buckets: RwLock<BTreeMap<String, Bucket>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Bucket>>> {
    self.buckets.read().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Bucket>>> {
    self.buckets.write().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    self.write()?.entry(bucket.to_string()).or_default();
    Ok(())
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    Ok(self.read()?.contains_key(bucket))
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(self.read()?.keys().cloned().collect())
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    Ok(self.write()?.remove(bucket).is_some())
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    if !key.is_cacheable() {
      return Ok(None);
    }
    Ok(
      self
        .read()?
        .get(bucket)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.put_all(bucket, &[(key.clone(), response.clone())])
  }

  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    // Validate everything before touching the bucket
    for (key, _) in entries {
      ensure_cacheable(key)?;
    }

    let mut buckets = self.write()?;
    let target = buckets
      .get_mut(bucket)
      .ok_or_else(|| eyre!("Cache bucket {} is not open", bucket))?;

    let cached_at = Utc::now();
    for (key, response) in entries {
      target.insert(
        key.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at,
        },
      );
    }
    Ok(())
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    Ok(
      self
        .read()?
        .get(bucket)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}
