//! Core request/response types for the caching system.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// What kind of resource a request is loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  /// Full page navigation
  Document,
  Style,
  Script,
  Image,
  Font,
  /// Web app manifest
  Manifest,
  #[default]
  Other,
}

impl Destination {
  pub fn is_document(self) -> bool {
    matches!(self, Destination::Document)
  }
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "style" => Ok(Self::Style),
      "script" => Ok(Self::Script),
      "image" => Ok(Self::Image),
      "font" => Ok(Self::Font),
      "manifest" => Ok(Self::Manifest),
      "other" | "" => Ok(Self::Other),
      other => Err(format!("unknown request destination: {}", other)),
    }
  }
}

/// An outbound request intercepted from the page.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
  pub headers: BTreeMap<String, String>,
}

impl Request {
  /// A plain `GET` for a subresource.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      destination: Destination::Other,
      headers: BTreeMap::new(),
    }
  }

  /// A top-level document navigation.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Identity of this request inside a bucket.
  pub fn cache_key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Identity of a request inside a bucket: upper-cased method plus the URL
/// without its fragment. Headers are not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self::from_parts(method, url.as_str())
  }

  /// Rebuild a key from stored parts.
  pub fn from_parts(method: &str, url: &str) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Only `GET` requests can be stored or matched.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response from the network or from a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_status_text(mut self, status_text: &str) -> Self {
    self.status_text = status_text.to_string();
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// True for statuses in the 200-299 range.
  pub fn is_ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }
}

/// A response stored in a bucket.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was written to the bucket
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the current bucket
  Cache,
  /// Live network response, not written back
  Network,
  /// Cache and network both failed, serving the cached fallback document
  OfflineFallback,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      CacheSource::Cache => "cache",
      CacheSource::Network => "network",
      CacheSource::OfflineFallback => "offline fallback",
    };
    f.write_str(label)
  }
}

/// Result of an intercepted fetch, including the response and its source.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  /// The response handed back to the page
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl FetchResponse {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  pub fn offline(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::OfflineFallback,
      cached_at: Some(cached.cached_at),
    }
  }
}
