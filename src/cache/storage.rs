//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey, Response};

/// Trait for cache storage backends.
///
/// Every call is individually atomic. Implementations are shared between
/// concurrent fetch interceptions, so they must be `Send + Sync`.
pub trait CacheStorage: Send + Sync {
  /// Open a bucket, creating it if it does not exist.
  fn open(&self, bucket: &str) -> Result<()>;

  /// Check whether a bucket exists.
  fn has(&self, bucket: &str) -> Result<bool>;

  /// Names of every bucket, sorted.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Delete a bucket and all its entries. Returns false if it did not exist.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// Look up a request in a bucket. A missing bucket is a miss.
  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a single response in an open bucket.
  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store a batch of responses. Either every entry is written or none is.
  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Request keys stored in a bucket, sorted.
  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

impl<S: CacheStorage + ?Sized> CacheStorage for std::sync::Arc<S> {
  fn open(&self, bucket: &str) -> Result<()> {
    (**self).open(bucket)
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    (**self).has(bucket)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    (**self).bucket_names()
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    (**self).delete_bucket(bucket)
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    (**self).match_request(bucket, key)
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    (**self).put(bucket, key, response)
  }

  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    (**self).put_all(bucket, entries)
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    (**self).keys(bucket)
  }
}

/// Reject writes the Cache API would refuse.
pub(crate) fn ensure_cacheable(key: &RequestKey) -> Result<()> {
  if key.is_cacheable() {
    Ok(())
  } else {
    Err(eyre!("Cannot cache {}: only GET requests can be stored", key))
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open(&self, _bucket: &str) -> Result<()> {
    Ok(())
  }

  fn has(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_bucket(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }

  fn match_request(&self, _bucket: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(&self, _bucket: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(&self, _bucket: &str, _entries: &[(RequestKey, Response)]) -> Result<()> {
    Ok(()) // Discard
  }

  fn keys(&self, _bucket: &str) -> Result<Vec<RequestKey>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Create a throwaway storage that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("precache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named bucket
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request identity
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, method, url),
    FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

fn bucket_exists(conn: &Connection, bucket: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT 1 FROM buckets WHERE name = ?",
      params![bucket],
      |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))
}

fn insert_entry(conn: &Connection, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
  ensure_cacheable(key)?;
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (bucket, method, url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        key.method(),
        key.url(),
        response.status,
        response.status_text,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;
    Ok(())
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    let conn = self.lock()?;
    bucket_exists(&conn, bucket)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of bucket {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    if !key.is_cacheable() {
      return Ok(None);
    }

    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, status_text, headers, body, cached_at FROM entries
         WHERE bucket = ? AND method = ? AND url = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = stmt
      .query_row(params![bucket, key.method(), key.url()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, status_text, headers, body, cached_at_str)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            status_text,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    if !bucket_exists(&conn, bucket)? {
      return Err(eyre!("Cache bucket {} is not open", bucket));
    }
    insert_entry(&conn, bucket, key, response)
  }

  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let conn = self.lock()?;
    if !bucket_exists(&conn, bucket)? {
      return Err(eyre!("Cache bucket {} is not open", bucket));
    }

    // Dropping the transaction on an early return rolls every write back
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, bucket, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE bucket = ? ORDER BY method, url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![bucket], |row| {
        let method: String = row.get(0)?;
        let url: String = row.get(1)?;
        Ok(RequestKey::from_parts(&method, &url))
      })
      .map_err(|e| eyre!("Failed to list entries of bucket {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
