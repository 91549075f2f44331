//! Push payloads and user-visible notifications.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use gamemuse_common::{OptionExt, Result};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::NotificationConfig;

/// Why a push payload was rejected.
#[derive(Error, Debug)]
pub enum PushPayloadError {
    #[error("push message carried no data")]
    Missing,

    #[error("push data is not a valid payload: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// JSON body of a push message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl PushPayload {
    pub fn parse(data: Option<&[u8]>) -> std::result::Result<Self, PushPayloadError> {
        let data = data.ok_or(PushPayloadError::Missing)?;
        Ok(serde_json::from_slice(data)?)
    }
}

/// Notification identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A notification the worker asks the platform to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Deep link opened when the user activates the notification.
    pub url: String,
}

impl Notification {
    pub fn from_payload(payload: PushPayload, config: &NotificationConfig) -> Self {
        Self {
            id: NotificationId::new(),
            title: payload.title,
            body: payload.body,
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            url: payload.url.unwrap_or_else(|| config.default_url.clone()),
        }
    }
}

/// Platform notification surface.
#[async_trait]
pub trait NotificationHost: Send + Sync {
    async fn show(&self, notification: &Notification) -> Result<()>;

    async fn close(&self, id: NotificationId) -> Result<()>;
}

/// In-process [`NotificationHost`] that keeps displayed notifications.
#[derive(Debug, Default)]
pub struct NotificationTray {
    shown: RwLock<HashMap<NotificationId, Notification>>,
}

impl NotificationTray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications currently displayed, oldest first.
    pub async fn visible(&self) -> Vec<Notification> {
        let mut visible: Vec<Notification> = self.shown.read().await.values().cloned().collect();
        visible.sort_by_key(|n| n.id);
        visible
    }
}

#[async_trait]
impl NotificationHost for NotificationTray {
    async fn show(&self, notification: &Notification) -> Result<()> {
        self.shown
            .write()
            .await
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn close(&self, id: NotificationId) -> Result<()> {
        self.shown
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_not_found(format!("notification {}", id.raw()))
    }
}
