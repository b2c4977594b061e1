//! Scripted network backend for tests.

use crate::{CacheError, FetchRequest, NetworkBackend, ResponseSnapshot};
use driftwave_core::ResourceManifest;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

/// A network backend replaying scripted responses and counting hits.
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<HashMap<String, Result<ResponseSnapshot, CacheError>>>,
    hits: AtomicUsize,
}

impl ScriptedBackend {
    /// A backend that knows no routes; every fetch fails.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A backend serving every manifest resource with a small body.
    pub fn for_manifest(origin: &Url, manifest: &ResourceManifest) -> Self {
        let backend = Self::empty();
        for path in &manifest.resources {
            if let Ok(url) = origin.join(path) {
                backend.serve(
                    url.as_str(),
                    ResponseSnapshot::ok(format!("resource:{path}").into_bytes()),
                );
            }
        }
        backend
    }

    /// Script a response for a URL.
    pub fn serve(&self, url: &str, snapshot: ResponseSnapshot) {
        self.responses
            .lock()
            .expect("scripted backend poisoned")
            .insert(url.to_string(), Ok(snapshot));
    }

    /// Script a network failure for a URL.
    pub fn fail(&self, url: &str) {
        self.responses
            .lock()
            .expect("scripted backend poisoned")
            .insert(
                url.to_string(),
                Err(CacheError::Network("offline".to_string())),
            );
    }

    /// Total fetches performed against this backend.
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl NetworkBackend for ScriptedBackend {
    fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot, CacheError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .expect("scripted backend poisoned")
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(|| Err(CacheError::Network(format!("no route to {}", request.url))))
    }
}
