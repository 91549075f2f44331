//! The offline controller: one handler per lifecycle event.
//!
//! # Fetch strategies
//!
//! | Request class | Strategy | Cache write |
//! |---------------|----------|-------------|
//! | Catalog API   | network first, cache fallback | detached, timestamped |
//! | Everything else | cache first, network fill | awaited |
//!
//! Two concurrent misses for the same key both reach the network and both
//! write the cache. The last write wins; entries are whole snapshots, so a
//! reader never sees a mix of the two.

use std::sync::Arc;

use futures::future::try_join_all;
use gamemuse_common::{GameMuseError, Result as CommonResult};
use gamemuse_net::{Fetcher, Request, Response};
use hashbrown::HashSet;
use http::Method;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStore, RequestKey};
use crate::clients::{ClientHost, ClientId, ClientType, WindowClients};
use crate::config::WorkerConfig;
use crate::policy::{response_is_cacheable, Classifier, RequestClass, CACHE_TIMESTAMP_HEADER};
use crate::push::{Notification, NotificationHost, NotificationTray, PushPayload};
use crate::sync::{HttpSyncBackend, MemoryOutbox, Outbox, SyncBackend, SyncOutcome, SyncTag};
use crate::{now_millis, ServiceWorkerError, WorkerState};

type Result<T> = std::result::Result<T, ServiceWorkerError>;

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
}

/// Response handed back to the application for an intercepted fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: ResponseSource,
}

/// What activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Generations evicted because they are not on the whitelist.
    pub deleted: Vec<String>,
    /// Clients newly brought under control.
    pub claimed: usize,
}

/// How a notification click reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickAction {
    /// A window was already showing the target.
    Focused,
    /// An existing window was sent to the target.
    Navigated,
    /// No window was open.
    Opened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickOutcome {
    pub client_id: ClientId,
    pub target: Url,
    pub action: ClickAction,
}

/// Builder for [`OfflineController`].
///
/// A store and a fetcher are required; the remaining collaborators default
/// to the in-process implementations.
pub struct OfflineControllerBuilder {
    config: WorkerConfig,
    store: Option<Arc<dyn CacheStore>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    clients: Option<Arc<dyn ClientHost>>,
    notifications: Option<Arc<dyn NotificationHost>>,
    outbox: Option<Arc<dyn Outbox>>,
    backend: Option<Arc<dyn SyncBackend>>,
}

impl OfflineControllerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            store: None,
            fetcher: None,
            clients: None,
            notifications: None,
            outbox: None,
            backend: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clients(mut self, clients: Arc<dyn ClientHost>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn NotificationHost>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Override the sync backend. Without one, an HTTP backend is built
    /// when the config names a sync endpoint.
    pub fn backend(mut self, backend: Arc<dyn SyncBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<OfflineController> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| GameMuseError::config("offline controller needs a cache store"))?;
        let fetcher = self
            .fetcher
            .ok_or_else(|| GameMuseError::config("offline controller needs a fetcher"))?;

        let backend = self.backend.or_else(|| {
            self.config.sync.endpoint.clone().map(|endpoint| {
                Arc::new(HttpSyncBackend::new(
                    Arc::clone(&fetcher),
                    endpoint,
                    self.config.sync.retry.clone(),
                )) as Arc<dyn SyncBackend>
            })
        });

        let (state, _) = watch::channel(WorkerState::Parsed);

        Ok(OfflineController {
            classifier: Classifier::new(self.config.catalog_pattern.clone()),
            config: Arc::new(self.config),
            store,
            fetcher,
            clients: self
                .clients
                .unwrap_or_else(|| Arc::new(WindowClients::new())),
            notifications: self
                .notifications
                .unwrap_or_else(|| Arc::new(NotificationTray::new())),
            outbox: self.outbox.unwrap_or_else(|| Arc::new(MemoryOutbox::new())),
            backend,
            state,
            writes: TaskTracker::new(),
        })
    }
}

/// Offline cache controller for the GameMuse app.
pub struct OfflineController {
    config: Arc<WorkerConfig>,
    classifier: Classifier,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<dyn ClientHost>,
    notifications: Arc<dyn NotificationHost>,
    outbox: Arc<dyn Outbox>,
    backend: Option<Arc<dyn SyncBackend>>,
    state: watch::Sender<WorkerState>,
    /// Detached catalog cache writes.
    writes: TaskTracker,
}

impl OfflineController {
    pub fn builder(config: WorkerConfig) -> OfflineControllerBuilder {
        OfflineControllerBuilder::new(config)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Move to `next` if the current state is one of `allowed`.
    fn begin(&self, allowed: &[WorkerState], next: WorkerState) -> Result<WorkerState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if allowed.contains(state) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        match previous {
            Some(from) => {
                info!(?from, to = ?next, "Worker state transition");
                Ok(from)
            }
            None => Err(ServiceWorkerError::StateError(format!(
                "cannot enter {next:?} from {:?}",
                self.state()
            ))),
        }
    }

    fn set_state(&self, next: WorkerState) {
        let from = self.state.send_replace(next);
        info!(?from, to = ?next, "Worker state transition");
    }

    // ==================== Lifecycle ====================

    /// Precache the static manifest.
    ///
    /// All manifest assets are fetched before anything is written; if any of
    /// them fails, nothing is stored and the worker becomes redundant.
    /// Returns the number of assets cached.
    #[instrument(skip(self), fields(generation = %self.config.static_cache))]
    pub async fn install(&self) -> Result<usize> {
        self.begin(
            &[WorkerState::Parsed, WorkerState::Redundant],
            WorkerState::Installing,
        )?;

        match self.precache().await {
            Ok(count) => {
                self.set_state(WorkerState::Installed);
                info!(count, "Static assets cached");
                Ok(count)
            }
            Err(e) => {
                error!(error = %e, "Install failed");
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<usize> {
        let urls = self.config.manifest_urls()?;
        let entries = try_join_all(urls.into_iter().map(|url| self.fetch_manifest_asset(url))).await?;
        let count = entries.len();

        self.store
            .put_all(&self.config.static_cache, entries)
            .await
            .map_err(ServiceWorkerError::Cache)?;
        Ok(count)
    }

    async fn fetch_manifest_asset(&self, url: Url) -> Result<CacheEntry> {
        let request = Request::get(url.clone());
        let response = self.fetcher.fetch(&request).await.map_err(|e| {
            ServiceWorkerError::InstallFailed {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;
        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed {
                url,
                reason: format!("status {}", response.status),
            });
        }
        debug!(url = %url, "Fetched manifest asset");
        Ok(CacheEntry::capture(
            RequestKey::for_request(&request),
            &response,
            now_millis(),
        ))
    }

    /// Pick up an earlier install from the store without touching the network.
    ///
    /// Moves `Parsed` to `Installed` when the static generation already holds
    /// every manifest asset. Returns `false`, leaving the state alone, when
    /// any asset is missing.
    #[instrument(skip(self), fields(generation = %self.config.static_cache))]
    pub async fn resume(&self) -> Result<bool> {
        if self.state() != WorkerState::Parsed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot resume from {:?}",
                self.state()
            )));
        }

        let stored: HashSet<RequestKey> = self
            .store
            .keys(&self.config.static_cache)
            .await
            .map_err(ServiceWorkerError::Cache)?
            .into_iter()
            .collect();
        let missing = self
            .config
            .manifest_urls()?
            .iter()
            .filter(|url| !stored.contains(&RequestKey::new(&Method::GET, url)))
            .count();
        if missing > 0 {
            debug!(missing, "Previous install incomplete");
            return Ok(false);
        }

        self.begin(&[WorkerState::Parsed], WorkerState::Installed)?;
        info!(count = stored.len(), "Resumed from cached install");
        Ok(true)
    }

    /// Evict generations outside the whitelist, then claim every client.
    ///
    /// On failure the worker stays installed so activation can be retried.
    #[instrument(skip(self))]
    pub async fn activate(&self) -> Result<ActivationReport> {
        self.begin(&[WorkerState::Installed], WorkerState::Activating)?;

        match self.evict_and_claim().await {
            Ok(report) => {
                self.set_state(WorkerState::Activated);
                info!(deleted = ?report.deleted, claimed = report.claimed, "Worker activated");
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Activation failed");
                self.set_state(WorkerState::Installed);
                Err(e)
            }
        }
    }

    async fn evict_and_claim(&self) -> Result<ActivationReport> {
        let whitelist = self.config.whitelist();
        let stale: Vec<String> = self
            .store
            .generations()
            .await
            .map_err(ServiceWorkerError::Cache)?
            .into_iter()
            .filter(|name| !whitelist.contains(&name.as_str()))
            .collect();

        try_join_all(stale.iter().map(|name| async move {
            info!(generation = %name, "Deleting old cache");
            self.store.delete_generation(name).await
        }))
        .await
        .map_err(ServiceWorkerError::Cache)?;

        let claimed = self.clients.claim().await?;
        Ok(ActivationReport {
            deleted: stale,
            claimed,
        })
    }

    // ==================== Fetch ====================

    /// Answer an intercepted request.
    ///
    /// Before activation requests go straight to the network.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        if self.state() != WorkerState::Activated {
            debug!(state = ?self.state(), "Not activated, passing through");
            let response = self.fetcher.fetch(&request).await?;
            return Ok(FetchOutcome {
                response,
                source: ResponseSource::Network,
            });
        }

        match self.classifier.classify(&request.url) {
            RequestClass::Catalog => self.network_first(request).await,
            RequestClass::StaticAsset => self.cache_first(request).await,
        }
    }

    async fn network_first(&self, request: Request) -> Result<FetchOutcome> {
        let key = RequestKey::for_request(&request);
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response_is_cacheable(&request.method, &response) {
                    self.spawn_catalog_write(key, &response);
                }
                debug!(status = %response.status, "Catalog served from network");
                Ok(FetchOutcome {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(e) => {
                warn!(error = %e, "Catalog network request failed, trying cache");
                match self.lookup(&key).await {
                    Some(response) => Ok(FetchOutcome {
                        response,
                        source: ResponseSource::Cache,
                    }),
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Detached write of a timestamped copy into the API generation.
    fn spawn_catalog_write(&self, key: RequestKey, response: &Response) {
        let written_at = now_millis();
        let entry = CacheEntry::capture(key, response, written_at)
            .with_header(CACHE_TIMESTAMP_HEADER, written_at.to_string());
        let store = Arc::clone(&self.store);
        let generation = self.config.api_cache.clone();

        self.writes.spawn(async move {
            let key = entry.key.clone();
            match store.put(&generation, entry).await {
                Ok(()) => debug!(%key, %generation, "Cached catalog response"),
                Err(e) => warn!(%key, %generation, error = %e, "Catalog cache write failed"),
            }
        });
    }

    async fn cache_first(&self, request: Request) -> Result<FetchOutcome> {
        let key = RequestKey::for_request(&request);
        if let Some(response) = self.lookup(&key).await {
            debug!("Served from cache");
            return Ok(FetchOutcome {
                response,
                source: ResponseSource::Cache,
            });
        }

        let response = self.fetcher.fetch(&request).await?;
        if response_is_cacheable(&request.method, &response) {
            let entry = CacheEntry::capture(key, &response, now_millis());
            if let Err(e) = self.store.put(&self.config.static_cache, entry).await {
                warn!(error = %e, "Static cache write failed");
            }
        }
        Ok(FetchOutcome {
            response,
            source: ResponseSource::Network,
        })
    }

    /// Find `key` in any generation. Store failures count as misses.
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let entry = match self.store.match_any(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(%key, error = %e, "Cache lookup failed");
                return None;
            }
        };
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(%key, error = %e, "Ignoring corrupt cache entry");
                None
            }
        }
    }

    /// Wait for every detached cache write started so far.
    pub async fn settle(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    // ==================== Sync ====================

    /// Replay the outbox for a sync tag.
    ///
    /// Resolves once every queued mutation is applied and confirmed. The
    /// first failure stops the replay; the failed mutation and everything
    /// after it stay queued for the platform's next attempt.
    #[instrument(skip(self))]
    pub async fn handle_sync(&self, tag: &str) -> Result<SyncOutcome> {
        let Some(tag) = SyncTag::from_name(tag) else {
            debug!("Ignoring unknown sync tag");
            return Ok(SyncOutcome::Ignored);
        };

        let confirmed = self
            .replay(tag)
            .await
            .map_err(|source| ServiceWorkerError::SyncFailed { tag, source })?;
        info!(%tag, confirmed, "Sync complete");
        Ok(SyncOutcome::Synced { tag, confirmed })
    }

    async fn replay(&self, tag: SyncTag) -> CommonResult<usize> {
        let pending = self.outbox.pending(tag).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| GameMuseError::sync("no sync backend configured"))?;

        for mutation in &pending {
            backend.apply(mutation).await?;
            self.outbox.confirm(tag, mutation.id).await?;
            debug!(id = mutation.id.raw(), "Mutation confirmed");
        }
        Ok(pending.len())
    }

    // ==================== Push ====================

    /// Show a notification for a push message.
    ///
    /// Malformed payloads are logged and dropped.
    #[instrument(skip(self, data))]
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Option<Notification> {
        let payload = match PushPayload::parse(data) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Dropping push message");
                return None;
            }
        };

        let notification = Notification::from_payload(payload, &self.config.notification);
        match self.notifications.show(&notification).await {
            Ok(()) => {
                debug!(id = notification.id.raw(), url = %notification.url, "Notification shown");
                Some(notification)
            }
            Err(e) => {
                error!(error = %e, "Failed to show notification");
                None
            }
        }
    }

    /// Dismiss a notification, then bring the user to its deep link.
    #[instrument(skip(self, notification), fields(id = notification.id.raw(), url = %notification.url))]
    pub async fn handle_notification_click(
        &self,
        notification: &Notification,
    ) -> Result<ClickOutcome> {
        if let Err(e) = self.notifications.close(notification.id).await {
            warn!(error = %e, "Notification already dismissed");
        }

        let target = self.config.resolve(&notification.url)?;
        let outcome = self.open_target(target).await?;
        info!(action = ?outcome.action, target = %outcome.target, "Notification click handled");
        Ok(outcome)
    }

    /// Focus a window already at `target`, else send an existing window
    /// there, else open a new one.
    async fn open_target(&self, target: Url) -> Result<ClickOutcome> {
        let windows = self.clients.match_all(ClientType::Window).await?;

        if let Some(open) = windows.iter().find(|c| c.url == target) {
            let client = self.clients.focus(open.id).await?;
            return Ok(ClickOutcome {
                client_id: client.id,
                target,
                action: ClickAction::Focused,
            });
        }
        if let Some(window) = windows.iter().find(|c| c.focused).or(windows.first()) {
            self.clients.navigate(window.id, &target).await?;
            let client = self.clients.focus(window.id).await?;
            return Ok(ClickOutcome {
                client_id: client.id,
                target,
                action: ClickAction::Navigated,
            });
        }
        let client = self.clients.open_window(&target).await?;
        Ok(ClickOutcome {
            client_id: client.id,
            target,
            action: ClickAction::Opened,
        })
    }
}
