//! Offline cache manager driven by the host's lifecycle events.
//!
//! The host calls [`OfflineCacheManager::install`] once per deployment,
//! [`OfflineCacheManager::activate`] after install has finished, and
//! [`OfflineCacheManager::handle_fetch`] for every intercepted request.
//! Fetches may arrive at any time, including while install is still
//! running; until the bucket is populated they simply miss.

use color_eyre::{eyre::eyre, Report, Result};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, FetchResponse, Request, RequestKey};
use crate::config::{Config, DEFAULT_OFFLINE_FALLBACK};
use crate::manifest::Manifest;
use crate::network::Network;

/// Lifecycle state of the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, no lifecycle event seen yet.
  #[default]
  Parsed,
  /// Install event in progress.
  Installing,
  /// Install finished, whether or not the bucket is complete.
  Installed,
  /// Activate event in progress.
  Activating,
  /// Active and serving fetches.
  Activated,
  /// Superseded: a newer manifest's activation deleted this bucket.
  Redundant,
}

/// Result of the install phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Every manifest entry was fetched and stored.
  Complete { bucket: String, entries: usize },
  /// The batch failed and nothing was stored. The worker is still installed.
  Incomplete {
    bucket: String,
    url: Option<Url>,
    reason: String,
  },
}

impl InstallOutcome {
  pub fn is_complete(&self) -> bool {
    matches!(self, InstallOutcome::Complete { .. })
  }
}

/// Result of a background-sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  Handled,
  Ignored,
}

struct InstallFailure {
  url: Option<Url>,
  reason: String,
}

/// Owns the current bucket and answers intercepted fetches from it.
pub struct OfflineCacheManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  manifest: Arc<Manifest>,
  offline_fallback: Option<RequestKey>,
  sync_tags: Arc<BTreeSet<String>>,
  state: Arc<RwLock<WorkerState>>,
}

impl<S: CacheStorage, N: Network> OfflineCacheManager<S, N> {
  /// Create a manager for `manifest`. The offline fallback defaults to
  /// `/index.html` on the manifest origin and the only sync tag is
  /// `contact-form`.
  pub fn new(storage: S, network: N, manifest: Manifest) -> Self {
    let offline_fallback = match manifest.resolve(DEFAULT_OFFLINE_FALLBACK) {
      Ok(url) => Some(RequestKey::new("GET", &url)),
      Err(e) => {
        warn!(origin = %manifest.origin(), "Offline fallback disabled: {:#}", e);
        None
      }
    };

    Self {
      storage: Arc::new(storage),
      network: Arc::new(network),
      manifest: Arc::new(manifest),
      offline_fallback,
      sync_tags: Arc::new(BTreeSet::from(["contact-form".to_string()])),
      state: Arc::new(RwLock::new(WorkerState::Parsed)),
    }
  }

  /// Build a manager from configuration.
  pub fn from_config(config: &Config, storage: S, network: N) -> Result<Self> {
    let manifest = config.build_manifest()?;
    let fallback = manifest.resolve(&config.offline_fallback)?;

    Ok(
      Self::new(storage, network, manifest)
        .with_offline_fallback(Some(fallback))
        .with_sync_tags(config.sync_tags.iter().cloned()),
    )
  }

  /// Set the cached document served to offline navigations. `None`
  /// disables the fallback.
  pub fn with_offline_fallback(mut self, url: Option<Url>) -> Self {
    self.offline_fallback = url.map(|u| RequestKey::new("GET", &u));
    self
  }

  pub fn with_sync_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
    self.sync_tags = Arc::new(tags.into_iter().collect());
    self
  }

  pub fn manifest(&self) -> &Manifest {
    &self.manifest
  }

  /// Name of the current bucket.
  pub fn bucket_name(&self) -> &str {
    self.manifest.bucket_name()
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub async fn state(&self) -> WorkerState {
    *self.state.read().await
  }

  async fn set_state(&self, state: WorkerState) {
    *self.state.write().await = state;
  }

  /// Install phase: open the current bucket and populate it from the
  /// manifest as one batch.
  ///
  /// All-or-nothing: if any entry fails to fetch or comes back with a
  /// non-2xx status, nothing is stored and the bucket stays empty. The
  /// failure is logged and reported, never raised, and the worker ends up
  /// `Installed` either way. No retry.
  pub async fn install(&self) -> InstallOutcome {
    self.set_state(WorkerState::Installing).await;

    let bucket = self.bucket_name().to_string();
    info!(bucket = %bucket, entries = self.manifest.len(), "Installing cache");

    let outcome = match self.populate(&bucket).await {
      Ok(entries) => {
        info!(bucket = %bucket, entries, "Cache installed");
        InstallOutcome::Complete { bucket, entries }
      }
      Err(failure) => {
        match &failure.url {
          Some(url) => warn!(bucket = %bucket, url = %url, "Cache install failed: {}", failure.reason),
          None => warn!(bucket = %bucket, "Cache install failed: {}", failure.reason),
        }
        InstallOutcome::Incomplete {
          bucket,
          url: failure.url,
          reason: failure.reason,
        }
      }
    };

    self.set_state(WorkerState::Installed).await;
    outcome
  }

  async fn populate(&self, bucket: &str) -> std::result::Result<usize, InstallFailure> {
    self.storage.open(bucket).map_err(|e| InstallFailure {
      url: None,
      reason: format!("{:#}", e),
    })?;

    let requests = self.manifest.requests();
    let results = join_all(requests.iter().map(|request| self.network.fetch(request))).await;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(results) {
      match result {
        Ok(response) if response.is_ok() => entries.push((request.cache_key(), response)),
        Ok(response) => {
          return Err(InstallFailure {
            url: Some(request.url.clone()),
            reason: format!("unexpected status {}", response.status),
          })
        }
        Err(e) => {
          return Err(InstallFailure {
            url: Some(request.url.clone()),
            reason: format!("{:#}", e),
          })
        }
      }
    }

    self.storage.put_all(bucket, &entries).map_err(|e| InstallFailure {
      url: None,
      reason: format!("{:#}", e),
    })?;

    Ok(entries.len())
  }

  /// Activate phase: delete every bucket except the current one.
  ///
  /// Returns the deleted names. Running it again with no version change
  /// deletes nothing. A deletion error aborts the phase and is returned.
  ///
  /// The current bucket must exist, either from this worker's install or
  /// from one run by an earlier process. Otherwise nothing is deleted and a
  /// state error is returned. An activated worker whose bucket has since
  /// been deleted was superseded by a newer manifest and becomes
  /// `Redundant`.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let current = self.bucket_name();
    {
      let mut state = self.state.write().await;
      match *state {
        WorkerState::Installing => {
          return Err(eyre!("Cannot activate while install is still running"))
        }
        WorkerState::Redundant => {
          return Err(eyre!("Cannot activate a redundant worker ({})", current))
        }
        _ => {}
      }

      if !self.storage.has(current)? {
        if *state == WorkerState::Activated {
          info!(bucket = %current, "Cache superseded by a newer manifest");
          *state = WorkerState::Redundant;
          return Err(eyre!("Cache {} was superseded, worker is redundant", current));
        }
        return Err(eyre!("Cannot activate before cache {} is installed", current));
      }
      *state = WorkerState::Activating;
    }

    let mut deleted = Vec::new();
    for name in self.storage.bucket_names()? {
      if name != current {
        info!(bucket = %name, "Deleting old cache");
        self.storage.delete_bucket(&name)?;
        deleted.push(name);
      }
    }

    self.set_state(WorkerState::Activated).await;
    Ok(deleted)
  }

  /// Fetch interception: cache first, then network.
  ///
  /// A hit never touches the network and is never revalidated. A miss goes
  /// to the network once and the response is not written back. When both
  /// fail, document navigations get the cached offline fallback; every
  /// other request gets the error.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchResponse> {
    match self.cache_then_network(request).await {
      Ok(response) => Ok(response),
      Err(err) if request.destination.is_document() => self.offline_fallback(request, err),
      Err(err) => Err(err),
    }
  }

  async fn cache_then_network(&self, request: &Request) -> Result<FetchResponse> {
    let key = request.cache_key();

    if let Some(cached) = self.storage.match_request(self.bucket_name(), &key)? {
      debug!(%key, "Cache hit");
      return Ok(FetchResponse::from_cache(cached));
    }

    debug!(%key, "Cache miss");
    let response = self.network.fetch(request).await?;
    Ok(FetchResponse::from_network(response))
  }

  fn offline_fallback(&self, request: &Request, err: Report) -> Result<FetchResponse> {
    let Some(key) = &self.offline_fallback else {
      return Err(err);
    };

    match self.storage.match_request(self.bucket_name(), key) {
      Ok(Some(cached)) => {
        warn!(url = %request.url, error = %err, "Serving offline fallback {}", key.url());
        Ok(FetchResponse::offline(cached))
      }
      Ok(None) => Err(err.wrap_err(format!("Offline fallback {} is not cached", key.url()))),
      Err(lookup) => Err(err.wrap_err(format!("Offline fallback lookup failed: {}", lookup))),
    }
  }

  /// Background sync: acknowledge configured tags, ignore the rest.
  pub fn sync(&self, tag: &str) -> SyncOutcome {
    if self.sync_tags.contains(tag) {
      info!(tag, "Background sync triggered");
      SyncOutcome::Handled
    } else {
      debug!(tag, "Ignoring unknown sync tag");
      SyncOutcome::Ignored
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for OfflineCacheManager<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      manifest: Arc::clone(&self.manifest),
      offline_fallback: self.offline_fallback.clone(),
      sync_tags: Arc::clone(&self.sync_tags),
      state: Arc::clone(&self.state),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CachedResponse, Destination, MemoryStorage, Response};
  use crate::manifest::ManifestEntry;
  use crate::network::testing::ScriptedNetwork;

  const ORIGIN: &str = "https://simum.example/";

  fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
  }

  fn url(path: &str) -> Url {
    origin().join(path).unwrap()
  }

  fn manifest(paths: &[&str]) -> Manifest {
    let entries: Vec<ManifestEntry> = paths.iter().map(|p| ManifestEntry::from(*p)).collect();
    Manifest::new("simum-portfolio", &origin(), &entries).unwrap()
  }

  fn site_network(paths: &[&str]) -> ScriptedNetwork {
    paths.iter().fold(ScriptedNetwork::new(), |net, path| {
      net.route(url(path).as_str(), Response::new(200, format!("body of {}", path)))
    })
  }

  const SITE: &[&str] = &["/", "/index.html", "/styles.css", "/script.js"];

  fn manager(
    storage: MemoryStorage,
    network: Arc<ScriptedNetwork>,
    paths: &[&str],
  ) -> OfflineCacheManager<MemoryStorage, Arc<ScriptedNetwork>> {
    OfflineCacheManager::new(storage, network, manifest(paths))
  }

  #[tokio::test]
  async fn test_install_populates_bucket() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);

    let outcome = worker.install().await;
    assert_eq!(
      outcome,
      InstallOutcome::Complete {
        bucket: worker.bucket_name().to_string(),
        entries: 4
      }
    );
    assert_eq!(worker.state().await, WorkerState::Installed);
    assert_eq!(worker.storage().keys(worker.bucket_name()).unwrap().len(), 4);
    assert_eq!(network.calls(), 4);
  }

  #[tokio::test]
  async fn test_partial_install_stores_nothing() {
    // /script.js has no route, so its fetch fails
    let network = Arc::new(site_network(&["/", "/index.html", "/styles.css"]));
    let worker = manager(MemoryStorage::new(), network, SITE);

    let outcome = worker.install().await;
    match &outcome {
      InstallOutcome::Incomplete { url: Some(failed), .. } => assert_eq!(failed, &url("/script.js")),
      other => panic!("expected incomplete install, got {:?}", other),
    }
    assert!(!outcome.is_complete());
    assert_eq!(worker.state().await, WorkerState::Installed);
    assert!(worker.storage().has(worker.bucket_name()).unwrap());
    assert!(worker.storage().keys(worker.bucket_name()).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let network = Arc::new(
      site_network(&["/", "/index.html"])
        .route(url("/styles.css").as_str(), Response::new(404, "missing")),
    );
    let worker = manager(MemoryStorage::new(), network, &["/", "/index.html", "/styles.css"]);

    match worker.install().await {
      InstallOutcome::Incomplete { reason, .. } => assert!(reason.contains("404")),
      other => panic!("expected incomplete install, got {:?}", other),
    }
    assert!(worker.storage().keys(worker.bucket_name()).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activation_is_idempotent() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network, SITE);
    worker.install().await;

    assert!(worker.activate().await.unwrap().is_empty());
    assert!(worker.activate().await.unwrap().is_empty());
    assert_eq!(
      worker.storage().bucket_names().unwrap(),
      vec![worker.bucket_name().to_string()]
    );
    assert_eq!(worker.state().await, WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_activate_refuses_to_overlap_install() {
    let worker = manager(MemoryStorage::new(), Arc::new(ScriptedNetwork::new()), SITE);
    worker.set_state(WorkerState::Installing).await;
    assert!(worker.activate().await.is_err());
    assert_eq!(worker.state().await, WorkerState::Installing);
  }

  #[tokio::test]
  async fn test_activate_before_install_keeps_existing_buckets() {
    let storage = MemoryStorage::new();
    storage.open("simum-portfolio-old").unwrap();
    storage
      .put(
        "simum-portfolio-old",
        &RequestKey::new("GET", &url("/index.html")),
        &Response::new(200, "old"),
      )
      .unwrap();

    let worker = manager(storage, Arc::new(ScriptedNetwork::new()), SITE);
    assert!(worker.activate().await.is_err());
    assert_eq!(worker.state().await, WorkerState::Parsed);
    assert_eq!(
      worker.storage().bucket_names().unwrap(),
      vec!["simum-portfolio-old".to_string()]
    );
    assert_eq!(worker.storage().keys("simum-portfolio-old").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_activate_after_install_in_earlier_process() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(site_network(SITE));
    storage.open("simum-portfolio-old").unwrap();

    let installer = OfflineCacheManager::new(storage.clone(), network.clone(), manifest(SITE));
    assert!(installer.install().await.is_complete());

    // Fresh worker over the same storage, as a new CLI invocation would build
    let activator = OfflineCacheManager::new(storage.clone(), network, manifest(SITE));
    assert_eq!(activator.state().await, WorkerState::Parsed);
    let deleted = activator.activate().await.unwrap();
    assert_eq!(deleted, vec!["simum-portfolio-old".to_string()]);
    assert_eq!(activator.state().await, WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_superseded_worker_becomes_redundant() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(site_network(SITE));

    let old = OfflineCacheManager::new(
      storage.clone(),
      network.clone(),
      manifest(&["/", "/index.html"]),
    );
    assert!(old.install().await.is_complete());
    old.activate().await.unwrap();
    assert_eq!(old.state().await, WorkerState::Activated);

    let new = OfflineCacheManager::new(storage.clone(), network, manifest(SITE));
    assert!(new.install().await.is_complete());
    assert_eq!(new.activate().await.unwrap(), vec![old.bucket_name().to_string()]);

    assert!(old.activate().await.is_err());
    assert_eq!(old.state().await, WorkerState::Redundant);
    assert!(old.activate().await.is_err());
    assert_eq!(storage.bucket_names().unwrap(), vec![new.bucket_name().to_string()]);
  }

  #[tokio::test]
  async fn test_delete_error_aborts_activation() {
    // Storage whose bucket deletions always fail
    struct StuckStorage(MemoryStorage);

    impl CacheStorage for StuckStorage {
      fn open(&self, bucket: &str) -> Result<()> {
        self.0.open(bucket)
      }
      fn has(&self, bucket: &str) -> Result<bool> {
        self.0.has(bucket)
      }
      fn bucket_names(&self) -> Result<Vec<String>> {
        self.0.bucket_names()
      }
      fn delete_bucket(&self, _bucket: &str) -> Result<bool> {
        Err(eyre!("database is locked"))
      }
      fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        self.0.match_request(bucket, key)
      }
      fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
        self.0.put(bucket, key, response)
      }
      fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
        self.0.put_all(bucket, entries)
      }
      fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
        self.0.keys(bucket)
      }
    }

    let inner = MemoryStorage::new();
    inner.open("simum-portfolio-old").unwrap();
    let network = Arc::new(site_network(SITE));
    let worker = OfflineCacheManager::new(StuckStorage(inner), network, manifest(SITE));
    assert!(worker.install().await.is_complete());

    let err = worker.activate().await.unwrap_err();
    assert!(err.to_string().contains("database is locked"));
    assert_eq!(worker.state().await, WorkerState::Activating);
    assert!(worker.storage().has("simum-portfolio-old").unwrap());
  }

  #[tokio::test]
  async fn test_unresolvable_origin_disables_fallback() {
    let origin = Url::parse("mailto:site@simum.example").unwrap();
    let manifest = Manifest::new("simum-portfolio", &origin, &[]).unwrap();
    let network = Arc::new(ScriptedNetwork::new());
    network.set_offline(true);
    let worker = OfflineCacheManager::new(MemoryStorage::new(), network, manifest);

    assert!(worker.offline_fallback.is_none());
    let request = Request::navigate(Url::parse("https://simum.example/").unwrap());
    let err = worker.handle_fetch(&request).await.unwrap_err();
    assert!(!format!("{:#}", err).contains("not cached"));
  }

  #[tokio::test]
  async fn test_version_rollover_deletes_old_bucket() {
    let storage = MemoryStorage::new();
    storage.open("simum-portfolio-v1").unwrap();
    storage
      .put(
        "simum-portfolio-v1",
        &RequestKey::new("GET", &url("/index.html")),
        &Response::new(200, "old"),
      )
      .unwrap();

    let network = Arc::new(site_network(SITE));
    let worker = manager(storage, network, SITE);
    assert!(worker.install().await.is_complete());

    let deleted = worker.activate().await.unwrap();
    assert_eq!(deleted, vec!["simum-portfolio-v1".to_string()]);
    assert_eq!(
      worker.storage().bucket_names().unwrap(),
      vec![worker.bucket_name().to_string()]
    );

    let keys: Vec<String> = worker
      .storage()
      .keys(worker.bucket_name())
      .unwrap()
      .iter()
      .map(|k| k.url().to_string())
      .collect();
    let mut expected: Vec<String> = SITE.iter().map(|p| url(p).to_string()).collect();
    expected.sort();
    assert_eq!(keys, expected);
  }

  #[tokio::test]
  async fn test_cache_hit_skips_network() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);
    worker.install().await;
    let after_install = network.calls();

    for path in SITE {
      let response = worker.handle_fetch(&Request::get(url(path))).await.unwrap();
      assert_eq!(response.source, CacheSource::Cache);
      assert_eq!(response.response.body, format!("body of {}", path).into_bytes());
      assert!(response.cached_at.is_some());
    }
    assert_eq!(network.calls(), after_install);
  }

  #[tokio::test]
  async fn test_cache_hit_survives_network_outage() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);
    worker.install().await;
    network.set_offline(true);

    let response = worker
      .handle_fetch(&Request::get(url("/styles.css")))
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_cache_miss_passes_through_without_caching() {
    let network = Arc::new(
      site_network(SITE).route(url("/api/projects").as_str(), Response::new(200, "[]")),
    );
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);
    worker.install().await;
    let before = network.calls();

    let request = Request::get(url("/api/projects"));
    let response = worker.handle_fetch(&request).await.unwrap();
    assert_eq!(response.source, CacheSource::Network);
    assert_eq!(response.response, Response::new(200, "[]"));
    assert_eq!(network.calls(), before + 1);

    assert!(worker
      .storage()
      .match_request(worker.bucket_name(), &request.cache_key())
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_network_error_status_is_returned_unmodified() {
    let network = Arc::new(ScriptedNetwork::new().route(
      url("/gone.html").as_str(),
      Response::new(410, "gone").with_status_text("Gone"),
    ));
    let worker = manager(MemoryStorage::new(), network, &[]);

    let response = worker
      .handle_fetch(&Request::navigate(url("/gone.html")))
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::Network);
    assert_eq!(response.response.status, 410);
  }

  #[tokio::test]
  async fn test_offline_document_falls_back_to_cached_root() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);
    worker.install().await;
    network.set_offline(true);

    let response = worker
      .handle_fetch(&Request::navigate(url("/projects/launchpad")))
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::OfflineFallback);
    assert_eq!(response.response.body, b"body of /index.html".to_vec());
  }

  #[tokio::test]
  async fn test_offline_subresource_propagates_error() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);
    worker.install().await;
    network.set_offline(true);

    let request = Request::get(url("/assets/images/missing.jpg")).with_destination(Destination::Image);
    assert!(worker.handle_fetch(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_offline_document_without_cached_fallback_errors() {
    let network = Arc::new(ScriptedNetwork::new());
    network.set_offline(true);
    let worker = manager(MemoryStorage::new(), network, SITE);

    let err = worker
      .handle_fetch(&Request::navigate(url("/")))
      .await
      .unwrap_err();
    assert!(format!("{:#}", err).contains("not cached"));
  }

  #[tokio::test]
  async fn test_custom_fallback_and_disabled_fallback() {
    let network = Arc::new(site_network(&["/", "/offline.html"]));
    let worker = manager(MemoryStorage::new(), network.clone(), &["/", "/offline.html"])
      .with_offline_fallback(Some(url("/offline.html")));
    worker.install().await;
    network.set_offline(true);

    let response = worker
      .handle_fetch(&Request::navigate(url("/about")))
      .await
      .unwrap();
    assert_eq!(response.response.body, b"body of /offline.html".to_vec());

    let without = worker.clone().with_offline_fallback(None);
    assert!(without
      .handle_fetch(&Request::navigate(url("/about")))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_fetch_before_install_goes_to_network() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);

    let response = worker.handle_fetch(&Request::get(url("/styles.css"))).await.unwrap();
    assert_eq!(response.source, CacheSource::Network);
    assert_eq!(network.calls(), 1);
    assert_eq!(worker.state().await, WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_non_get_requests_always_go_to_network() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);
    worker.install().await;
    let before = network.calls();

    let request = Request::get(url("/index.html")).with_method("POST");
    let response = worker.handle_fetch(&request).await.unwrap();
    assert_eq!(response.source, CacheSource::Network);
    assert_eq!(network.calls(), before + 1);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_the_bucket() {
    let network = Arc::new(site_network(SITE));
    let worker = manager(MemoryStorage::new(), network.clone(), SITE);
    worker.install().await;
    let before = network.calls();

    let handles: Vec<_> = SITE
      .iter()
      .map(|path| {
        let worker = worker.clone();
        let request = Request::get(url(path));
        tokio::spawn(async move { worker.handle_fetch(&request).await })
      })
      .collect();

    for handle in handles {
      let response = handle.await.unwrap().unwrap();
      assert_eq!(response.source, CacheSource::Cache);
    }
    assert_eq!(network.calls(), before);
  }

  #[test]
  fn test_sync_tags() {
    let worker = manager(MemoryStorage::new(), Arc::new(ScriptedNetwork::new()), SITE);
    assert_eq!(worker.sync("contact-form"), SyncOutcome::Handled);
    assert_eq!(worker.sync("newsletter"), SyncOutcome::Ignored);

    let worker = worker.with_sync_tags(vec!["outbox".to_string()]);
    assert_eq!(worker.sync("outbox"), SyncOutcome::Handled);
    assert_eq!(worker.sync("contact-form"), SyncOutcome::Ignored);
  }

  #[tokio::test]
  async fn test_from_config() {
    let config = Config::from_yaml(
      r#"
name: simum-portfolio
origin: https://simum.example/
offline_fallback: /offline.html
sync_tags: [outbox]
manifest:
  - /
  - /offline.html
"#,
    )
    .unwrap();
    let network = Arc::new(site_network(&["/", "/offline.html"]));
    let worker = OfflineCacheManager::from_config(&config, MemoryStorage::new(), network.clone())
      .unwrap();

    assert_eq!(worker.bucket_name(), config.build_manifest().unwrap().bucket_name());
    assert!(worker.install().await.is_complete());
    network.set_offline(true);
    let response = worker.handle_fetch(&Request::navigate(url("/x"))).await.unwrap();
    assert_eq!(response.response.body, b"body of /offline.html".to_vec());
    assert_eq!(worker.sync("outbox"), SyncOutcome::Handled);
  }

  #[tokio::test]
  async fn test_lookup_error_on_document_uses_fallback_path() {
    // Storage whose lookups fail for everything except the fallback
    struct FlakyStorage {
      inner: MemoryStorage,
      fallback: RequestKey,
    }

    impl CacheStorage for FlakyStorage {
      fn open(&self, bucket: &str) -> Result<()> {
        self.inner.open(bucket)
      }
      fn has(&self, bucket: &str) -> Result<bool> {
        self.inner.has(bucket)
      }
      fn bucket_names(&self) -> Result<Vec<String>> {
        self.inner.bucket_names()
      }
      fn delete_bucket(&self, bucket: &str) -> Result<bool> {
        self.inner.delete_bucket(bucket)
      }
      fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        if key == &self.fallback {
          self.inner.match_request(bucket, key)
        } else {
          Err(eyre!("disk I/O error"))
        }
      }
      fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
        self.inner.put(bucket, key, response)
      }
      fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
        self.inner.put_all(bucket, entries)
      }
      fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
        self.inner.keys(bucket)
      }
    }

    let storage = FlakyStorage {
      inner: MemoryStorage::new(),
      fallback: RequestKey::new("GET", &url("/index.html")),
    };
    let network = Arc::new(site_network(SITE));
    let worker = OfflineCacheManager::new(storage, network.clone(), manifest(SITE));
    worker.install().await;
    let before = network.calls();

    let response = worker.handle_fetch(&Request::navigate(url("/"))).await.unwrap();
    assert_eq!(response.source, CacheSource::OfflineFallback);
    assert_eq!(network.calls(), before);

    assert!(worker.handle_fetch(&Request::get(url("/styles.css"))).await.is_err());
  }
}
