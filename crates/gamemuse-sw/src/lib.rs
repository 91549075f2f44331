//! # GameMuse Offline Worker
//!
//! The offline cache controller behind the GameMuse installable app: it sits
//! between the application and the network, decides whether each request is
//! answered from the durable cache or the network, and manages cache
//! generations across application versions.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the app shell), activate (evict stale
//!   generations, claim clients)
//! - **Fetch interception**: network-first for the game catalog API,
//!   cache-first for everything else
//! - **Background sync**: drains the offline outbox for favorites and
//!   collections
//! - **Push**: turns push payloads into notifications with a deep link
//!
//! ## Architecture
//!
//! ```text
//! OfflineController
//!     │
//!     ├── WorkerConfig (immutable, injected)
//!     ├── Fetcher ─────────────── network (gamemuse-net)
//!     ├── CacheStore
//!     │       └── generation → RequestKey → CacheEntry
//!     ├── Outbox + SyncBackend ── background sync
//!     ├── NotificationHost ────── push
//!     └── ClientHost ──────────── claim / focus / open window
//! ```
//!
//! Every collaborator is a trait object, so the whole lifecycle runs in tests
//! without a browser.

use std::time::{SystemTime, UNIX_EPOCH};

use gamemuse_common::GameMuseError;
use gamemuse_net::NetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod cache;
pub mod clients;
pub mod config;
pub mod controller;
pub mod policy;
pub mod push;
pub mod sqlite;
pub mod sync;

pub use cache::{CacheEntry, CacheStore, MemoryCacheStore, RequestKey};
pub use clients::{Client, ClientHost, ClientId, ClientType, WindowClients};
pub use config::{NotificationConfig, SyncConfig, WorkerConfig};
pub use controller::{
    ActivationReport, ClickAction, ClickOutcome, FetchOutcome, OfflineController,
    OfflineControllerBuilder, ResponseSource,
};
pub use policy::{is_cacheable, Classifier, RequestClass, CACHE_TIMESTAMP_HEADER};
pub use push::{Notification, NotificationHost, NotificationId, NotificationTray, PushPayload};
pub use sqlite::SqliteCacheStore;
pub use sync::{
    GameRef, HttpSyncBackend, MemoryOutbox, Mutation, MutationId, Outbox, PendingMutation,
    SyncBackend, SyncOutcome, SyncTag,
};

// ==================== Errors ====================

/// Errors surfaced by the controller's lifecycle handlers.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    /// The network failed and no cached copy could stand in.
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    /// A manifest asset could not be fetched; nothing was cached.
    #[error("Install failed at {url}: {reason}")]
    InstallFailed { url: Url, reason: String },

    /// The durable cache store failed.
    #[error("Cache error: {0}")]
    Cache(#[source] GameMuseError),

    /// A lifecycle handler was invoked in the wrong state.
    #[error("State error: {0}")]
    StateError(String),

    /// Offline mutations could not all be confirmed; the platform should retry.
    #[error("Sync '{tag}' failed: {source}")]
    SyncFailed {
        tag: SyncTag,
        #[source]
        source: GameMuseError,
    },

    /// Configuration, client, or notification host errors.
    #[error(transparent)]
    Common(#[from] GameMuseError),
}

// ==================== Types ====================

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, not yet installed.
    #[default]
    Parsed,
    /// Precaching the static manifest.
    Installing,
    /// Precache complete; eligible for immediate activation.
    Installed,
    /// Evicting stale generations and claiming clients.
    Activating,
    /// Intercepting every fetch.
    Activated,
    /// Install failed.
    Redundant,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
