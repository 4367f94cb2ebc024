//! # OfflineKit Worker
//!
//! App-shell cache controller and update coordination for the OfflineKit
//! offline-cache toolkit.
//!
//! ## Features
//!
//! - **Lifecycle**: install (atomic shell pre-cache), activate (stale-bucket
//!   purge), redundancy on failure
//! - **Fetch routing**: navigation fallback, cache-first, and
//!   stale-while-revalidate strategies selected by request shape
//! - **Update coordination**: a waiting worker activates only when the page
//!   opts in via the skip-waiting control message
//!
//! ## Architecture
//!
//! ```text
//! UpdateCoordinator
//!     ├── active  (CacheController, Activated)
//!     └── waiting (CacheController, Installed)
//!
//! CacheController
//!     ├── WorkerInstance (state machine)
//!     ├── BucketStore (shared)
//!     └── Network (fetch seam)
//! ```

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use offlinekit_cache::{BucketStore, CacheEntry, RequestKey};
use offlinekit_common::OfflineKitError;

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Cache error: {0}")]
    Cache(#[from] OfflineKitError),
}

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Initial state, nothing installed yet.
    #[default]
    Parsed,
    /// Pre-caching the app shell.
    Installing,
    /// Shell cached, waiting for activation.
    Installed,
    /// Purging stale buckets and taking control.
    Activating,
    /// Active and routing fetches.
    Activated,
    /// Replaced or install failed.
    Redundant,
}

impl WorkerState {
    /// Whether this state allows fetch routing.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, WorkerState::Activated)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Parsed => write!(f, "parsed"),
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Installed => write!(f, "installed"),
            WorkerState::Activating => write!(f, "activating"),
            WorkerState::Activated => write!(f, "activated"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

/// A worker instance's identity and lifecycle position.
#[derive(Debug)]
struct WorkerInstance {
    id: WorkerId,
    state: WorkerState,
    state_changed_at: Instant,
}

impl WorkerInstance {
    fn new() -> Self {
        Self {
            id: WorkerId::new(),
            state: WorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(
            worker = self.id.0,
            from = %self.state,
            to = %state,
            dwell_ms = self.state_changed_at.elapsed().as_millis() as u64,
            "worker state change"
        );
        self.state = state;
        self.state_changed_at = Instant::now();
    }
}

// ==================== Fetch Types ====================

/// Request mode, as seen by the fetch interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// A full-page load or history navigation.
    Navigate,
    SameOrigin,
    Cors,
    #[default]
    NoCors,
}

/// What kind of resource a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    Document,
    Script,
    Style,
    Font,
    Image,
    Manifest,
    #[default]
    Other,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Request mode.
    pub mode: RequestMode,

    /// Resource destination.
    pub destination: Destination,

    /// Request headers.
    pub headers: HashMap<String, String>,
}

impl FetchRequest {
    /// Create a request.
    pub fn new(method: &str, url: Url, mode: RequestMode, destination: Destination) -> Self {
        Self {
            url,
            method: method.to_ascii_uppercase(),
            mode,
            destination,
            headers: HashMap::new(),
        }
    }

    /// A plain GET for a sub-resource.
    pub fn get(url: Url) -> Self {
        Self::new("GET", url, RequestMode::NoCors, Destination::Other)
    }

    /// A navigation request for a document.
    pub fn navigation(url: Url) -> Self {
        Self::new("GET", url, RequestMode::Navigate, Destination::Document)
    }

    /// A GET for a sub-resource with a known destination.
    pub fn subresource(url: Url, destination: Destination) -> Self {
        Self::new("GET", url, RequestMode::NoCors, destination)
    }

    /// The cache identity of this request.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }
}

/// A response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Whether this response was served from cache.
    pub from_cache: bool,
}

impl FetchResponse {
    /// Create a response from a cache entry.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            status_text: "OK".to_string(),
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            from_cache: true,
        }
    }

    /// Snapshot this response into a cache entry.
    pub fn to_entry(&self) -> CacheEntry {
        CacheEntry::new(self.status, self.headers.clone(), self.body.clone())
    }

    /// Whether the status is an HTTP success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ==================== Fetch Strategy ====================

/// The closed set of fetch strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Network first; cached shell document on network failure.
    NavigationFallback,
    /// Cached copy if present, otherwise fetch, store, and serve.
    CacheFirst,
    /// Cached copy now, background refresh for next time.
    StaleWhileRevalidate,
}

/// Classify a request into a strategy.
///
/// Navigations get the shell fallback so client-side-routed URLs resolve
/// offline. Fonts and images rarely change, so cache hits are safe and save
/// round-trips. Everything else is served stale and refreshed behind the
/// response.
pub fn classify(request: &FetchRequest) -> FetchStrategy {
    if request.mode == RequestMode::Navigate {
        return FetchStrategy::NavigationFallback;
    }
    match request.destination {
        Destination::Font | Destination::Image => FetchStrategy::CacheFirst,
        _ => FetchStrategy::StaleWhileRevalidate,
    }
}

// ==================== Network Seam ====================

/// The network a controller fetches through.
#[async_trait]
pub trait Network: Send + Sync {
    /// Issue a request and await its response.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, WorkerError>;
}

// ==================== Control Messages ====================

/// Page-to-worker control messages. Skip-waiting is the only recognized
/// shape; anything else on the channel is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl ControlMessage {
    /// Parse a raw message. Returns None for unrecognized shapes.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

// ==================== Worker Events ====================

/// Worker-to-page notifications.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A new worker reached the waiting state.
    UpdateAvailable { worker: WorkerId },
    /// A newly activated worker took control; the page should reload.
    ControllerChange { worker: WorkerId },
}

// ==================== Cache Config ====================

/// Shell paths pre-cached at install time. Build-hashed assets are covered
/// by the navigation fallback instead.
pub const DEFAULT_SHELL_PATHS: &[&str] = &["/", "/index.html", "/manifest.json", "/favicon.svg"];

/// Configuration for a cache controller.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bucket name; doubles as the deployed version string. Changing it
    /// across deployments is what triggers the stale-bucket purge.
    pub bucket_name: String,

    /// Resources pre-cached at install time.
    pub shell_paths: Vec<Url>,

    /// The document served when an offline navigation misses the network.
    pub shell_document: Url,
}

impl CacheConfig {
    /// Create a config with explicit shell URLs.
    pub fn new(bucket_name: &str, shell_paths: Vec<Url>, shell_document: Url) -> Self {
        Self {
            bucket_name: bucket_name.to_string(),
            shell_paths,
            shell_document,
        }
    }

    /// Create a config for an origin using the default shell paths.
    pub fn for_origin(bucket_name: &str, origin: &Url) -> Result<Self, WorkerError> {
        let shell_paths = DEFAULT_SHELL_PATHS
            .iter()
            .map(|path| {
                origin
                    .join(path)
                    .map_err(|e| WorkerError::InvalidUrl(format!("{}: {}", path, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let shell_document = origin
            .join("/index.html")
            .map_err(|e| WorkerError::InvalidUrl(e.to_string()))?;
        Ok(Self::new(bucket_name, shell_paths, shell_document))
    }
}

// ==================== Cache Controller ====================

/// Owns one worker instance's lifecycle and routes its fetches.
pub struct CacheController {
    config: CacheConfig,
    instance: RwLock<WorkerInstance>,
    store: Arc<RwLock<BucketStore>>,
    network: Arc<dyn Network>,
}

impl CacheController {
    /// Create a controller in the parsed state.
    pub fn new(config: CacheConfig, store: Arc<RwLock<BucketStore>>, network: Arc<dyn Network>) -> Self {
        Self {
            config,
            instance: RwLock::new(WorkerInstance::new()),
            store,
            network,
        }
    }

    /// This worker's ID.
    pub async fn id(&self) -> WorkerId {
        self.instance.read().await.id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        self.instance.read().await.state
    }

    /// The bucket this controller serves from.
    pub fn bucket_name(&self) -> &str {
        &self.config.bucket_name
    }

    /// Install: pre-cache the app shell.
    ///
    /// All-or-nothing. Every shell path must fetch successfully before a
    /// single entry is committed; on any failure the bucket is untouched and
    /// the instance becomes redundant.
    pub async fn install(&self) -> Result<(), WorkerError> {
        {
            let mut instance = self.instance.write().await;
            if instance.state != WorkerState::Parsed {
                return Err(WorkerError::State(format!(
                    "cannot install from state {}",
                    instance.state
                )));
            }
            instance.set_state(WorkerState::Installing);
        }

        info!(bucket = %self.config.bucket_name, "pre-caching app shell");

        let mut staged = Vec::with_capacity(self.config.shell_paths.len());
        for url in &self.config.shell_paths {
            let request = FetchRequest::get(url.clone());
            match self.network.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    staged.push((request.key(), response.to_entry()));
                }
                Ok(response) => {
                    return self
                        .fail_install(format!("{}: status {}", url, response.status))
                        .await;
                }
                Err(err) => {
                    return self.fail_install(format!("{}: {}", url, err)).await;
                }
            }
        }

        {
            let mut store = self.store.write().await;
            store.open(&self.config.bucket_name).put_all(staged);
        }

        let mut instance = self.instance.write().await;
        instance.set_state(WorkerState::Installed);
        info!(
            bucket = %self.config.bucket_name,
            paths = self.config.shell_paths.len(),
            "app shell pre-cached, worker waiting"
        );
        Ok(())
    }

    async fn fail_install(&self, reason: String) -> Result<(), WorkerError> {
        warn!(bucket = %self.config.bucket_name, %reason, "install failed, worker discarded");
        let mut instance = self.instance.write().await;
        instance.set_state(WorkerState::Redundant);
        Err(WorkerError::InstallFailed(reason))
    }

    /// Activate: purge every bucket that is not this worker's, then start
    /// routing fetches.
    pub async fn activate(&self) -> Result<(), WorkerError> {
        {
            let mut instance = self.instance.write().await;
            if instance.state != WorkerState::Installed {
                return Err(WorkerError::State(format!(
                    "cannot activate from state {}",
                    instance.state
                )));
            }
            instance.set_state(WorkerState::Activating);
        }

        let purged = {
            let mut store = self.store.write().await;
            store.purge_except(&self.config.bucket_name)
        };
        for name in &purged {
            info!(bucket = %name, "removed stale cache bucket");
        }

        let mut instance = self.instance.write().await;
        instance.set_state(WorkerState::Activated);
        info!(bucket = %self.config.bucket_name, "worker activated");
        Ok(())
    }

    /// Mark this worker redundant (replaced by a newer one).
    pub async fn retire(&self) {
        let mut instance = self.instance.write().await;
        instance.set_state(WorkerState::Redundant);
    }

    /// Handle a control message from the page.
    pub async fn on_message(&self, message: ControlMessage) -> Result<(), WorkerError> {
        match message {
            ControlMessage::SkipWaiting => {
                debug!("received skip-waiting message");
                if self.state().await == WorkerState::Installed {
                    self.activate().await
                } else {
                    // Nothing waiting to short-circuit.
                    Ok(())
                }
            }
        }
    }

    /// Handle a raw message from the page. Unrecognized shapes are ignored.
    pub async fn post_message_json(&self, raw: &str) -> Result<(), WorkerError> {
        match ControlMessage::parse(raw) {
            Some(message) => self.on_message(message).await,
            None => {
                debug!(%raw, "ignoring unrecognized message");
                Ok(())
            }
        }
    }

    /// Route an intercepted fetch.
    ///
    /// A worker that has not activated does not interpose; the request goes
    /// straight to the network.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchResponse, WorkerError> {
        if !self.state().await.can_intercept_fetch() {
            trace!(url = %request.url, "uncontrolled fetch, passing through");
            return self.network.fetch(request).await;
        }

        match classify(request) {
            FetchStrategy::NavigationFallback => self.navigation_fallback(request).await,
            FetchStrategy::CacheFirst => self.cache_first(request).await,
            FetchStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        }
    }

    /// Network first; cached shell document on any network failure.
    async fn navigation_fallback(&self, request: &FetchRequest) -> Result<FetchResponse, WorkerError> {
        match self.network.fetch(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                debug!(url = %request.url, error = %err, "navigation fetch failed, serving shell");
                let store = self.store.read().await;
                let shell_key = RequestKey::get(&self.config.shell_document);
                match store
                    .bucket(&self.config.bucket_name)
                    .ok()
                    .and_then(|bucket| bucket.match_request(&shell_key))
                {
                    Some(entry) => Ok(FetchResponse::from_entry(entry)),
                    None => Err(err),
                }
            }
        }
    }

    /// Cached copy if present; otherwise fetch, store, and serve.
    async fn cache_first(&self, request: &FetchRequest) -> Result<FetchResponse, WorkerError> {
        let key = request.key();
        {
            let store = self.store.read().await;
            if let Ok(bucket) = store.bucket(&self.config.bucket_name) {
                if let Some(entry) = bucket.match_request(&key) {
                    trace!(url = %request.url, "cache-first hit");
                    return Ok(FetchResponse::from_entry(entry));
                }
            }
        }

        let response = self.network.fetch(request).await?;
        let mut store = self.store.write().await;
        store
            .open(&self.config.bucket_name)
            .put(key, response.to_entry());
        Ok(response)
    }

    /// Cached copy now, refreshed in the background; network on a miss.
    async fn stale_while_revalidate(&self, request: &FetchRequest) -> Result<FetchResponse, WorkerError> {
        let key = request.key();
        let cached = {
            let store = self.store.read().await;
            store
                .bucket(&self.config.bucket_name)
                .ok()
                .and_then(|bucket| bucket.match_request(&key).cloned())
        };

        match cached {
            Some(entry) => {
                self.spawn_revalidation(request.clone());
                Ok(FetchResponse::from_entry(&entry))
            }
            None => {
                let response = self.network.fetch(request).await?;
                if response.status == 200 {
                    let mut store = self.store.write().await;
                    store
                        .open(&self.config.bucket_name)
                        .put(key, response.to_entry());
                }
                Ok(response)
            }
        }
    }

    /// Refresh a cached entry behind an already-served response. Only a
    /// status-200 result overwrites the entry; failures are swallowed, the
    /// stale value stands until the next request.
    fn spawn_revalidation(&self, request: FetchRequest) {
        let network = Arc::clone(&self.network);
        let store = Arc::clone(&self.store);
        let bucket_name = self.config.bucket_name.clone();
        tokio::spawn(async move {
            match network.fetch(&request).await {
                Ok(response) if response.status == 200 => {
                    let mut store = store.write().await;
                    store.open(&bucket_name).put(request.key(), response.to_entry());
                }
                Ok(response) => {
                    trace!(url = %request.url, status = response.status, "revalidation response not cacheable");
                }
                Err(err) => {
                    debug!(url = %request.url, error = %err, "background revalidation failed");
                }
            }
        });
    }
}

// ==================== Update Coordinator ====================

/// Bridges a waiting worker and the page so the user controls when a new
/// version takes over.
pub struct UpdateCoordinator {
    active: RwLock<Option<Arc<CacheController>>>,
    waiting: RwLock<Option<Arc<CacheController>>>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl UpdateCoordinator {
    /// Create a coordinator and the event stream the page listens on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                active: RwLock::new(None),
                waiting: RwLock::new(None),
                event_tx,
            },
            event_rx,
        )
    }

    /// Report a freshly installed worker.
    ///
    /// With no active worker it activates immediately. Otherwise it is held
    /// waiting and the page is notified; the live session is never upgraded
    /// out from under the user.
    pub async fn worker_installed(&self, worker: Arc<CacheController>) -> Result<(), WorkerError> {
        let mut active = self.active.write().await;
        if active.is_none() {
            worker.activate().await?;
            let id = worker.id().await;
            *active = Some(worker);
            let _ = self.event_tx.send(WorkerEvent::ControllerChange { worker: id });
            Ok(())
        } else {
            let id = worker.id().await;
            info!(worker = ?id, "new version waiting, notifying page");
            *self.waiting.write().await = Some(worker);
            let _ = self.event_tx.send(WorkerEvent::UpdateAvailable { worker: id });
            Ok(())
        }
    }

    /// The worker currently waiting, if any.
    pub async fn waiting_instance(&self) -> Option<Arc<CacheController>> {
        self.waiting.read().await.clone()
    }

    /// The worker currently in control, if any.
    pub async fn active_instance(&self) -> Option<Arc<CacheController>> {
        self.active.read().await.clone()
    }

    /// Post skip-waiting to the waiting worker.
    ///
    /// A no-op when nothing is waiting. On success the old controller is
    /// retired and a controller-change event tells the page to reload.
    pub async fn request_activation(&self) -> Result<(), WorkerError> {
        let waiting = self.waiting.write().await.take();
        let Some(worker) = waiting else {
            debug!("skip-waiting requested with no waiting worker");
            return Ok(());
        };

        worker.on_message(ControlMessage::SkipWaiting).await?;

        let mut active = self.active.write().await;
        if let Some(old) = active.replace(Arc::clone(&worker)) {
            old.retire().await;
        }
        let id = worker.id().await;
        let _ = self.event_tx.send(WorkerEvent::ControllerChange { worker: id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_classify_navigation() {
        let request = FetchRequest::navigation(url("https://app.example/settings"));
        assert_eq!(classify(&request), FetchStrategy::NavigationFallback);
    }

    #[test]
    fn test_classify_font_and_image() {
        let font = FetchRequest::subresource(url("https://app.example/a.woff2"), Destination::Font);
        let image = FetchRequest::subresource(url("https://app.example/a.png"), Destination::Image);
        assert_eq!(classify(&font), FetchStrategy::CacheFirst);
        assert_eq!(classify(&image), FetchStrategy::CacheFirst);
    }

    #[test]
    fn test_classify_everything_else() {
        let script =
            FetchRequest::subresource(url("https://app.example/a.js"), Destination::Script);
        let style = FetchRequest::subresource(url("https://app.example/a.css"), Destination::Style);
        let other = FetchRequest::get(url("https://app.example/api/tasks"));
        assert_eq!(classify(&script), FetchStrategy::StaleWhileRevalidate);
        assert_eq!(classify(&style), FetchStrategy::StaleWhileRevalidate);
        assert_eq!(classify(&other), FetchStrategy::StaleWhileRevalidate);
    }

    #[test]
    fn test_control_message_parse() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#),
            Some(ControlMessage::SkipWaiting)
        );
        assert_eq!(ControlMessage::parse(r#"{"type":"REFRESH"}"#), None);
        assert_eq!(ControlMessage::parse("not json"), None);
    }

    #[test]
    fn test_control_message_serializes_to_wire_shape() {
        let json = serde_json::to_string(&ControlMessage::SkipWaiting).unwrap();
        assert_eq!(json, r#"{"type":"SKIP_WAITING"}"#);
    }

    #[test]
    fn test_config_for_origin() {
        let config = CacheConfig::for_origin("shell-v1", &url("https://app.example/")).unwrap();
        assert_eq!(config.shell_paths.len(), DEFAULT_SHELL_PATHS.len());
        assert_eq!(config.shell_document.path(), "/index.html");
    }

    #[test]
    fn test_worker_state_display() {
        assert_eq!(WorkerState::Installed.to_string(), "installed");
        assert_eq!(WorkerState::Redundant.to_string(), "redundant");
    }

    #[test]
    fn test_fetch_response_entry_roundtrip() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/css".to_string());
        let response = FetchResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers,
            body: b"body{}".to_vec(),
            from_cache: false,
        };

        let served = FetchResponse::from_entry(&response.to_entry());
        assert_eq!(served.status, 200);
        assert_eq!(served.body, b"body{}");
        assert!(served.from_cache);
    }

    #[test]
    fn test_request_key_uses_method_and_url() {
        let a = FetchRequest::get(url("https://app.example/a.js"));
        let mut b = FetchRequest::get(url("https://app.example/a.js"));
        b.method = "HEAD".to_string();
        assert_ne!(a.key(), b.key());
    }
}
