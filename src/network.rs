//! Network access behind an injectable interface.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::{Request, Response};
use crate::config::NetworkConfig;

/// Performs live fetches on behalf of the cache manager.
///
/// Transport failures are errors. HTTP error statuses are not: they come
/// back as ordinary responses.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<N: Network + ?Sized> Network for std::sync::Arc<N> {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    (**self).fetch(request).await
  }
}

/// HTTP client wrapper
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let user_agent = config
      .user_agent
      .clone()
      .unwrap_or_else(|| format!("precache/{}", env!("CARGO_PKG_VERSION")));

    let mut builder = reqwest::Client::builder().user_agent(user_agent);
    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let response = self
      .client
      .request(method, request.url.clone())
      .headers(to_header_map(&request.headers)?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = from_header_map(response.headers());
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

fn to_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
  let mut map = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
    let value =
      HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value for {}: {}", name, e))?;
    map.insert(name, value);
  }
  Ok(map)
}

/// Header names come back lower-cased. Repeated fields are joined with
/// ", " in arrival order. Non-UTF-8 values are dropped.
fn from_header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut out: BTreeMap<String, String> = BTreeMap::new();
  for (name, value) in headers {
    let Ok(value) = value.to_str() else {
      continue;
    };
    out
      .entry(name.as_str().to_string())
      .and_modify(|joined| {
        joined.push_str(", ");
        joined.push_str(value);
      })
      .or_insert_with(|| value.to_string());
  }
  out
}
