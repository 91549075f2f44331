//! Worker configuration.
//!
//! A [`WorkerConfig`] is built once (defaults, or a JSON file) and handed to
//! the controller; nothing in the worker mutates it afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gamemuse_common::{GameMuseError, RetryConfig};
use gamemuse_net::{HttpConfig, UrlPattern};
use serde::{Deserialize, Serialize};
use url::Url;

/// Pixel sizes of the precached app icon set.
const ICON_SIZES: [u32; 8] = [72, 96, 128, 144, 152, 192, 384, 512];

/// Offline worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the application shell is served from; manifest paths and
    /// notification deep links resolve against it.
    pub origin: Url,

    /// Static-asset generation name (version-suffixed).
    pub static_cache: String,

    /// API-response generation name (version-suffixed).
    pub api_cache: String,

    /// Absolute paths precached at install. All must succeed.
    pub static_manifest: Vec<String>,

    /// Pattern identifying remote catalog requests.
    pub catalog_pattern: UrlPattern,

    /// Freshness window for cached API responses, in seconds. Enforced by
    /// readers, not by the worker.
    pub api_max_age_secs: u64,

    /// Notification display settings.
    pub notification: NotificationConfig,

    /// Background sync settings.
    pub sync: SyncConfig,

    /// HTTP client settings.
    pub http: HttpConfig,

    /// SQLite file backing the durable cache.
    pub store_path: PathBuf,
}

/// Notification display settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub icon: String,
    pub badge: String,
    /// Deep link used when a push payload carries no `url`.
    pub default_url: String,
}

/// Background sync settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL mutations are POSTed to; `None` leaves sync without a backend.
    pub endpoint: Option<Url>,
    /// Retry policy for each mutation.
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut static_manifest: Vec<String> = [
            "/",
            "/index.html",
            "/manifest.json",
            "/src/main.tsx",
            "/src/App.tsx",
            "/src/index.css",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        static_manifest.extend(
            ICON_SIZES
                .iter()
                .map(|size| format!("/icons/icon-{size}x{size}.png")),
        );
        static_manifest.push("/assets/forest-bg.png".to_string());

        Self {
            origin: Url::parse("http://localhost:3000/").expect("static origin parses"),
            static_cache: "gamemuse-v1".to_string(),
            api_cache: "gamemuse-api-v1".to_string(),
            static_manifest,
            catalog_pattern: UrlPattern::contains("api.rawg.io/api"),
            api_max_age_secs: 60 * 60 * 24,
            notification: NotificationConfig::default(),
            sync: SyncConfig::default(),
            http: HttpConfig::default(),
            store_path: default_store_path(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/badge-icon.png".to_string(),
            default_url: "/".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> gamemuse_common::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            GameMuseError::config_with_source(format!("invalid config {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> gamemuse_common::Result<()> {
        if self.static_cache.trim().is_empty() || self.api_cache.trim().is_empty() {
            return Err(GameMuseError::config("cache generation names must not be empty"));
        }
        if self.static_cache == self.api_cache {
            return Err(GameMuseError::config(
                "static and API generations must have distinct names",
            ));
        }
        if self.origin.cannot_be_a_base() {
            return Err(GameMuseError::config(format!(
                "origin {} cannot resolve relative paths",
                self.origin
            )));
        }
        if self.catalog_pattern.needle().is_empty() {
            return Err(GameMuseError::config("catalog pattern must not be empty"));
        }
        for path in &self.static_manifest {
            self.resolve(path)?;
        }
        Ok(())
    }

    /// Generations that survive activation.
    pub fn whitelist(&self) -> [&str; 2] {
        [self.static_cache.as_str(), self.api_cache.as_str()]
    }

    /// Resolve a path (or absolute URL) against the origin.
    pub fn resolve(&self, path: &str) -> gamemuse_common::Result<Url> {
        self.origin.join(path).map_err(|e| {
            GameMuseError::config_with_source(format!("cannot resolve '{path}'"), e)
        })
    }

    /// Manifest entries as absolute URLs, in manifest order.
    pub fn manifest_urls(&self) -> gamemuse_common::Result<Vec<Url>> {
        self.static_manifest.iter().map(|p| self.resolve(p)).collect()
    }

    /// Freshness window for cached API responses.
    pub fn api_ttl(&self) -> Duration {
        Duration::from_secs(self.api_max_age_secs)
    }
}

fn default_store_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gamemuse")
        .join("offline-cache.sqlite3")
}
