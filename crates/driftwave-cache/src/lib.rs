//! # Driftwave Cache
//!
//! Versioned offline resource cache for the Driftwave app shell.
//!
//! ## Features
//!
//! - **Buckets**: one named cache bucket per generation
//! - **Install population**: all-or-nothing capture of the resource manifest
//! - **Activation sweep**: eviction of superseded generations
//! - **Fetch policy**: cache-first for resources, network-first for
//!   navigations with an offline shell fallback
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage
//!     └── CacheBucket ("app-cache-v18")
//!             └── URL → CacheEntry (captured response snapshot)
//!
//! CacheManager
//!     ├── install()       populate the current bucket
//!     ├── activate()      delete every other bucket
//!     └── handle_fetch()  serve / fetch / passthrough
//! ```

pub mod testing;

use driftwave_core::{Generation, ResourceManifest};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in cache operations.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Cache write failed: {0}")]
    WriteFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

// ==================== Cache Entries ====================

/// A captured response snapshot stored under its request URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Captured at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn from_snapshot(url: &Url, snapshot: &ResponseSnapshot) -> Self {
        Self {
            url: url.to_string(),
            method: "GET".to_string(),
            status: snapshot.status,
            headers: snapshot.headers.clone(),
            body: snapshot.body.clone(),
            cached_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Buckets ====================

/// A named cache bucket owning the entries of one generation.
#[derive(Debug, Default)]
pub struct CacheBucket {
    /// Bucket name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl CacheBucket {
    /// Create an empty bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up an entry by URL.
    pub fn match_url(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Insert an entry. Concurrent writers may race on the same URL;
    /// last write wins, entries are idempotent snapshots.
    pub fn put(&mut self, url: &str, entry: CacheEntry) {
        self.entries.insert(url.to_string(), entry);
    }

    /// Remove an entry.
    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// All entry URLs.
    pub fn urls(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// The set of named buckets shared across worker generations.
#[derive(Debug, Default)]
pub struct CacheStorage {
    buckets: HashMap<String, CacheBucket>,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bucket, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut CacheBucket {
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| CacheBucket::new(name))
    }

    /// Whether a bucket exists.
    pub fn has(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// Delete a bucket.
    pub fn delete(&mut self, name: &str) -> bool {
        self.buckets.remove(name).is_some()
    }

    /// All bucket names.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    /// Look up an entry in a specific bucket.
    pub fn match_in(&self, bucket: &str, url: &str) -> Option<&CacheEntry> {
        self.buckets.get(bucket)?.match_url(url)
    }

    /// Insert into an existing bucket. Fails if the bucket has been
    /// deleted, e.g. by a concurrent activation sweep.
    pub fn put_in(&mut self, bucket: &str, url: &str, entry: CacheEntry) -> Result<(), CacheError> {
        match self.buckets.get_mut(bucket) {
            Some(b) => {
                b.put(url, entry);
                Ok(())
            }
            None => Err(CacheError::WriteFailed(format!(
                "bucket '{bucket}' does not exist"
            ))),
        }
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket exists.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Shared handle to cache storage.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

/// Create a new shared storage handle.
pub fn shared_storage() -> SharedCacheStorage {
    Arc::new(RwLock::new(CacheStorage::new()))
}

// ==================== Requests & Responses ====================

/// Request mode, deciding which fetch policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// A full-document load. Served network-first.
    Navigate,
    /// Any other resource request. Served cache-first.
    Resource,
}

/// An intercepted fetch request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Request URL.
    pub url: Url,

    /// Request mode.
    pub mode: RequestMode,
}

impl FetchRequest {
    /// Create a navigation request.
    pub fn navigation(url: Url) -> Self {
        Self {
            url,
            mode: RequestMode::Navigate,
        }
    }

    /// Create a non-navigation resource request.
    pub fn resource(url: Url) -> Self {
        Self {
            url,
            mode: RequestMode::Resource,
        }
    }

    /// Whether this is a full-document load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Response kind as seen by the cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Same-origin response with a readable body.
    Basic,
    /// Cross-origin response obtained via CORS.
    Cors,
    /// Opaque cross-origin response.
    Opaque,
}

/// A response snapshot, either freshly fetched or replayed from cache.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    /// Status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Response kind.
    pub kind: ResponseKind,

    /// Whether this snapshot was served from cache.
    pub from_cache: bool,
}

impl ResponseSnapshot {
    /// Create a same-origin 200 response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body,
            kind: ResponseKind::Basic,
            from_cache: false,
        }
    }

    /// Replay a cached entry.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            kind: ResponseKind::Basic,
            from_cache: true,
        }
    }

    /// Only fully-valid same-origin 200 responses are stored.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 && self.kind == ResponseKind::Basic
    }
}

/// Outcome of fetch interception.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    /// The request is not intercepted; the caller handles it natively.
    Passthrough,
    /// The request was served, from cache or network.
    Served(ResponseSnapshot),
}

// ==================== Network Backend ====================

/// The seam to the real network. Implementations are scripted in tests.
pub trait NetworkBackend: Send + Sync {
    /// Perform the request against the network.
    fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot, CacheError>;
}

// ==================== Cache Manager ====================

/// Owns the current generation's bucket and implements the install,
/// activation, and fetch-interception behavior of the background worker.
pub struct CacheManager {
    origin: Url,
    generation: Generation,
    bucket_name: String,
    manifest: ResourceManifest,
    storage: SharedCacheStorage,
    network: Arc<dyn NetworkBackend>,
}

impl CacheManager {
    /// Create a manager for one generation.
    pub fn new(
        origin: Url,
        cache_prefix: &str,
        generation: Generation,
        manifest: ResourceManifest,
        storage: SharedCacheStorage,
        network: Arc<dyn NetworkBackend>,
    ) -> Self {
        let bucket_name = generation.bucket_name(cache_prefix);
        Self {
            origin,
            generation,
            bucket_name,
            manifest,
            storage,
            network,
        }
    }

    /// The generation this manager serves.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// The bucket name for this generation.
    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    fn resource_url(&self, path: &str) -> Result<Url, CacheError> {
        self.origin
            .join(path)
            .map_err(|e| CacheError::InstallFailed(format!("bad resource path '{path}': {e}")))
    }

    /// Populate this generation's bucket from the resource manifest.
    ///
    /// All-or-nothing: every listed resource must fetch and store, or the
    /// partially-filled bucket is deleted and the install fails.
    pub async fn install(&self) -> Result<(), CacheError> {
        tracing::info!(bucket = %self.bucket_name, resources = self.manifest.len(), "Installing cache generation");

        let mut captured = Vec::with_capacity(self.manifest.len());
        for path in &self.manifest.resources {
            let url = self.resource_url(path)?;
            let request = FetchRequest::resource(url.clone());
            let snapshot = match self.network.fetch(&request) {
                Ok(s) if (200..300).contains(&s.status) => s,
                Ok(s) => {
                    self.discard_partial().await;
                    return Err(CacheError::InstallFailed(format!(
                        "resource '{path}' returned status {}",
                        s.status
                    )));
                }
                Err(e) => {
                    self.discard_partial().await;
                    return Err(CacheError::InstallFailed(format!(
                        "resource '{path}' failed: {e}"
                    )));
                }
            };
            captured.push((url, snapshot));
        }

        // Every resource fetched; commit in one pass.
        let mut storage = self.storage.write().await;
        let bucket = storage.open(&self.bucket_name);
        for (url, snapshot) in &captured {
            bucket.put(url.as_str(), CacheEntry::from_snapshot(url, snapshot));
        }

        tracing::info!(bucket = %self.bucket_name, "Cache generation populated");
        Ok(())
    }

    /// Drop whatever a failed install left behind so the
    /// one-bucket-per-generation invariant holds between retries.
    async fn discard_partial(&self) {
        let mut storage = self.storage.write().await;
        if storage.delete(&self.bucket_name) {
            tracing::debug!(bucket = %self.bucket_name, "Removed partial bucket after failed install");
        }
    }

    /// Delete every bucket that does not belong to this generation.
    /// Returns the deleted bucket names.
    pub async fn activate(&self) -> Vec<String> {
        let mut storage = self.storage.write().await;
        let stale: Vec<String> = storage
            .bucket_names()
            .into_iter()
            .filter(|name| name != &self.bucket_name)
            .collect();

        for name in &stale {
            tracing::info!(bucket = %name, "Removing old cache bucket");
            storage.delete(name);
        }
        stale
    }

    /// Apply the fetch policy to an intercepted request.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchDecision, CacheError> {
        // Cross-origin requests are never intercepted.
        if request.url.origin() != self.origin.origin() {
            return Ok(FetchDecision::Passthrough);
        }

        if request.is_navigation() {
            return self.fetch_navigation(request).await;
        }
        self.fetch_resource(request).await
    }

    /// Navigations go network-first so a reachable deployment always wins;
    /// the cached offline shell covers the failure path.
    async fn fetch_navigation(&self, request: &FetchRequest) -> Result<FetchDecision, CacheError> {
        match self.network.fetch(request) {
            Ok(snapshot) => Ok(FetchDecision::Served(snapshot)),
            Err(e) => {
                tracing::warn!(url = %request.url, error = %e, "Navigation fetch failed, serving offline shell");
                let shell_url = self.resource_url(&self.manifest.offline_shell)?;
                let storage = self.storage.read().await;
                match storage.match_in(&self.bucket_name, shell_url.as_str()) {
                    Some(entry) => Ok(FetchDecision::Served(ResponseSnapshot::from_entry(entry))),
                    None => Err(CacheError::NotFound(format!(
                        "offline shell '{}' not cached",
                        self.manifest.offline_shell
                    ))),
                }
            }
        }
    }

    /// Non-navigation requests are cache-first with opportunistic
    /// fetch-time capture of valid responses.
    async fn fetch_resource(&self, request: &FetchRequest) -> Result<FetchDecision, CacheError> {
        {
            let storage = self.storage.read().await;
            if let Some(entry) = storage.match_in(&self.bucket_name, request.url.as_str()) {
                return Ok(FetchDecision::Served(ResponseSnapshot::from_entry(entry)));
            }
        }

        let snapshot = self.network.fetch(request)?;

        if snapshot.is_cacheable() {
            // Store a clone; the original is returned to the caller.
            let entry = CacheEntry::from_snapshot(&request.url, &snapshot);
            let mut storage = self.storage.write().await;
            if let Err(e) = storage.put_in(&self.bucket_name, request.url.as_str(), entry) {
                // A failed write never fails the fetch itself.
                tracing::warn!(url = %request.url, error = %e, "Cache write failed");
            }
        }

        Ok(FetchDecision::Served(snapshot))
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;

    fn origin() -> Url {
        Url::parse("https://app.driftwave.dev").unwrap()
    }

    fn manifest() -> ResourceManifest {
        ResourceManifest::new(
            vec!["index.html".to_string(), "app.js".to_string()],
            "index.html",
        )
    }

    fn manager_with(
        generation: Generation,
        storage: SharedCacheStorage,
        backend: Arc<ScriptedBackend>,
    ) -> CacheManager {
        CacheManager::new(origin(), "app", generation, manifest(), storage, backend)
    }

    fn serve_manifest(backend: &ScriptedBackend) {
        backend.serve(
            "https://app.driftwave.dev/index.html",
            ResponseSnapshot::ok(b"<html>shell</html>".to_vec()),
        );
        backend.serve(
            "https://app.driftwave.dev/app.js",
            ResponseSnapshot::ok(b"console.log('app')".to_vec()),
        );
    }

    #[tokio::test]
    async fn test_install_populates_bucket() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);

        let manager = manager_with(Generation(1), storage.clone(), backend);
        manager.install().await.unwrap();

        let storage = storage.read().await;
        assert!(storage.has("app-cache-v1"));
        assert_eq!(
            storage
                .match_in("app-cache-v1", "https://app.driftwave.dev/index.html")
                .unwrap()
                .status,
            200
        );
    }

    #[tokio::test]
    async fn test_install_same_generation_twice_is_idempotent() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);

        let manager = manager_with(Generation(1), storage.clone(), backend);
        manager.install().await.unwrap();
        manager.install().await.unwrap();

        let storage = storage.read().await;
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.bucket_names(), vec!["app-cache-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        backend.serve(
            "https://app.driftwave.dev/index.html",
            ResponseSnapshot::ok(b"<html>shell</html>".to_vec()),
        );
        backend.fail("https://app.driftwave.dev/app.js");

        let manager = manager_with(Generation(1), storage.clone(), backend);
        assert!(manager.install().await.is_err());

        // No partial bucket survives.
        assert!(storage.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_non_2xx() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        backend.serve(
            "https://app.driftwave.dev/index.html",
            ResponseSnapshot {
                status: 404,
                ..ResponseSnapshot::ok(Vec::new())
            },
        );
        backend.serve(
            "https://app.driftwave.dev/app.js",
            ResponseSnapshot::ok(Vec::new()),
        );

        let manager = manager_with(Generation(1), storage.clone(), backend);
        assert!(manager.install().await.is_err());
        assert!(storage.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_activation_leaves_exactly_one_bucket() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);

        for generation in [Generation(1), Generation(2), Generation(3)] {
            let manager = manager_with(generation, storage.clone(), backend.clone());
            manager.install().await.unwrap();
        }
        assert_eq!(storage.read().await.len(), 3);

        let current = manager_with(Generation(3), storage.clone(), backend);
        let deleted = current.activate().await;

        assert_eq!(deleted.len(), 2);
        let storage = storage.read().await;
        assert_eq!(storage.len(), 1);
        assert!(storage.has("app-cache-v3"));
    }

    #[tokio::test]
    async fn test_cached_resource_needs_no_network() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);

        let manager = manager_with(Generation(1), storage.clone(), backend.clone());
        manager.install().await.unwrap();
        let installed_hits = backend.hit_count();

        let request =
            FetchRequest::resource(Url::parse("https://app.driftwave.dev/app.js").unwrap());
        let decision = manager.handle_fetch(&request).await.unwrap();

        match decision {
            FetchDecision::Served(snapshot) => {
                assert!(snapshot.from_cache);
                assert_eq!(snapshot.body, b"console.log('app')");
            }
            other => panic!("expected served, got {other:?}"),
        }
        assert_eq!(backend.hit_count(), installed_hits);
    }

    #[tokio::test]
    async fn test_miss_fetches_and_captures() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);
        backend.serve(
            "https://app.driftwave.dev/data.json",
            ResponseSnapshot::ok(b"{}".to_vec()),
        );

        let manager = manager_with(Generation(1), storage.clone(), backend.clone());
        manager.install().await.unwrap();

        let request =
            FetchRequest::resource(Url::parse("https://app.driftwave.dev/data.json").unwrap());
        let decision = manager.handle_fetch(&request).await.unwrap();
        assert!(matches!(decision, FetchDecision::Served(ref s) if !s.from_cache));

        // Captured: second fetch is a cache hit.
        let before = backend.hit_count();
        let decision = manager.handle_fetch(&request).await.unwrap();
        assert!(matches!(decision, FetchDecision::Served(ref s) if s.from_cache));
        assert_eq!(backend.hit_count(), before);
    }

    #[tokio::test]
    async fn test_non_basic_response_is_not_captured() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);
        backend.serve(
            "https://app.driftwave.dev/widget.js",
            ResponseSnapshot {
                kind: ResponseKind::Opaque,
                ..ResponseSnapshot::ok(b"widget".to_vec())
            },
        );

        let manager = manager_with(Generation(1), storage.clone(), backend.clone());
        manager.install().await.unwrap();

        let request =
            FetchRequest::resource(Url::parse("https://app.driftwave.dev/widget.js").unwrap());
        manager.handle_fetch(&request).await.unwrap();

        // Not captured: refetching hits the network again.
        let before = backend.hit_count();
        manager.handle_fetch(&request).await.unwrap();
        assert_eq!(backend.hit_count(), before + 1);
    }

    #[tokio::test]
    async fn test_cross_origin_is_not_intercepted() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        let manager = manager_with(Generation(1), storage, backend.clone());

        let request =
            FetchRequest::resource(Url::parse("https://fonts.example.com/font.woff2").unwrap());
        let decision = manager.handle_fetch(&request).await.unwrap();

        assert!(matches!(decision, FetchDecision::Passthrough));
        assert_eq!(backend.hit_count(), 0);
    }

    #[tokio::test]
    async fn test_navigation_prefers_network() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);
        backend.serve(
            "https://app.driftwave.dev/",
            ResponseSnapshot::ok(b"<html>fresh</html>".to_vec()),
        );

        let manager = manager_with(Generation(1), storage, backend);
        manager.install().await.unwrap();

        let request = FetchRequest::navigation(Url::parse("https://app.driftwave.dev/").unwrap());
        let decision = manager.handle_fetch(&request).await.unwrap();
        match decision {
            FetchDecision::Served(snapshot) => {
                assert!(!snapshot.from_cache);
                assert_eq!(snapshot.body, b"<html>fresh</html>");
            }
            other => panic!("expected served, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_navigation_serves_shell() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);

        let manager = manager_with(Generation(1), storage, backend.clone());
        manager.install().await.unwrap();

        // Go offline.
        backend.fail("https://app.driftwave.dev/");
        let request = FetchRequest::navigation(Url::parse("https://app.driftwave.dev/").unwrap());
        let decision = manager.handle_fetch(&request).await.unwrap();

        match decision {
            FetchDecision::Served(snapshot) => {
                assert!(snapshot.from_cache);
                assert_eq!(snapshot.body, b"<html>shell</html>");
            }
            other => panic!("expected offline shell, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resource_network_failure_surfaces() {
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        serve_manifest(&backend);

        let manager = manager_with(Generation(1), storage, backend.clone());
        manager.install().await.unwrap();

        backend.fail("https://app.driftwave.dev/late.js");
        let request =
            FetchRequest::resource(Url::parse("https://app.driftwave.dev/late.js").unwrap());
        assert!(manager.handle_fetch(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_capture_still_serves_response() {
        // No install: the bucket does not exist, so the opportunistic
        // write fails, but the response must still be returned.
        let storage = shared_storage();
        let backend = Arc::new(ScriptedBackend::empty());
        backend.serve(
            "https://app.driftwave.dev/data.json",
            ResponseSnapshot::ok(b"{}".to_vec()),
        );

        let manager = manager_with(Generation(1), storage.clone(), backend);
        let request =
            FetchRequest::resource(Url::parse("https://app.driftwave.dev/data.json").unwrap());
        let decision = manager.handle_fetch(&request).await.unwrap();

        assert!(matches!(decision, FetchDecision::Served(_)));
        assert!(storage.read().await.is_empty());
    }
}
