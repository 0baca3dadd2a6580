//! Precache manifest and the bucket name derived from it.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use url::Url;

use crate::cache::{Destination, Request};

/// Number of hex characters of the manifest digest kept in the bucket name.
const HASH_LEN: usize = 16;

/// One manifest entry as written in configuration.
///
/// Accepts either a bare URL string or a `{ url, revision }` map. The
/// revision lets a deployment invalidate an asset whose URL did not change.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawEntry")]
pub struct ManifestEntry {
  pub url: String,
  pub revision: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
  Plain(String),
  Revisioned {
    url: String,
    #[serde(default)]
    revision: Option<String>,
  },
}

impl From<RawEntry> for ManifestEntry {
  fn from(raw: RawEntry) -> Self {
    match raw {
      RawEntry::Plain(url) => Self { url, revision: None },
      RawEntry::Revisioned { url, revision } => Self { url, revision },
    }
  }
}

impl From<&str> for ManifestEntry {
  fn from(url: &str) -> Self {
    Self {
      url: url.to_string(),
      revision: None,
    }
  }
}

#[derive(Debug, Clone)]
struct ResolvedEntry {
  url: Url,
  revision: Option<String>,
}

/// The ordered list of assets fetched at install time.
#[derive(Debug, Clone)]
pub struct Manifest {
  origin: Url,
  entries: Vec<ResolvedEntry>,
  bucket_name: String,
}

impl Manifest {
  /// Resolve entries against `origin` and derive the bucket name.
  ///
  /// Fails on an empty prefix, unparsable URLs and entries that resolve to
  /// the same URL.
  pub fn new(prefix: &str, origin: &Url, entries: &[ManifestEntry]) -> Result<Self> {
    let prefix = prefix.trim();
    if prefix.is_empty() {
      return Err(eyre!("Manifest name must not be empty"));
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
      let mut url = origin
        .join(entry.url.trim())
        .map_err(|e| eyre!("Invalid manifest URL '{}': {}", entry.url, e))?;
      url.set_fragment(None);

      if !seen.insert(url.clone()) {
        return Err(eyre!("Duplicate manifest URL: {}", url));
      }
      resolved.push(ResolvedEntry {
        url,
        revision: entry.revision.clone(),
      });
    }

    let bucket_name = format!("{}-{}", prefix, manifest_hash(&resolved));

    Ok(Self {
      origin: origin.clone(),
      entries: resolved,
      bucket_name,
    })
  }

  /// Name of the bucket this manifest populates.
  pub fn bucket_name(&self) -> &str {
    &self.bucket_name
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Resolve a path or URL against the manifest origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url.trim())
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  pub fn urls(&self) -> impl Iterator<Item = &Url> {
    self.entries.iter().map(|e| &e.url)
  }

  pub fn contains(&self, url: &Url) -> bool {
    let mut url = url.clone();
    url.set_fragment(None);
    self.entries.iter().any(|e| e.url == url)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// The install-time requests, in manifest order.
  pub fn requests(&self) -> Vec<Request> {
    self
      .entries
      .iter()
      .map(|e| Request::get(e.url.clone()).with_destination(guess_destination(&e.url)))
      .collect()
  }
}

/// SHA256 over every resolved URL and revision, in order.
fn manifest_hash(entries: &[ResolvedEntry]) -> String {
  let mut hasher = Sha256::new();
  for entry in entries {
    hasher.update(entry.url.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(entry.revision.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"\n");
  }
  let mut digest = hex::encode(hasher.finalize());
  digest.truncate(HASH_LEN);
  digest
}

fn guess_destination(url: &Url) -> Destination {
  let path = url.path();
  if path.ends_with('/') || path.ends_with(".html") {
    return Destination::Document;
  }
  match path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
    Some(ext) => match ext.as_str() {
      "css" => Destination::Style,
      "js" | "mjs" => Destination::Script,
      "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" => Destination::Image,
      "woff" | "woff2" | "ttf" | "otf" => Destination::Font,
      "json" | "webmanifest" => Destination::Manifest,
      _ => Destination::Other,
    },
    None => Destination::Other,
  }
}
