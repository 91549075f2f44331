//! Background sync of mutations made while offline.
//!
//! The application queues each favorite or collection write in an
//! [`Outbox`]. When connectivity returns the platform fires a sync event
//! carrying a [`SyncTag`]; the controller replays that tag's queue against a
//! [`SyncBackend`] and confirms each mutation it applied.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gamemuse_common::{retry_with_backoff, GameMuseError, OptionExt, Result, RetryConfig};
use gamemuse_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use url::Url;

// ==================== Tags ====================

/// Sync event tag registered by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncTag {
    #[serde(rename = "sync-favorites")]
    Favorites,
    #[serde(rename = "sync-collections")]
    Collections,
}

impl SyncTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTag::Favorites => "sync-favorites",
            SyncTag::Collections => "sync-collections",
        }
    }

    /// Recognize a platform tag; unknown tags yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sync-favorites" => Some(SyncTag::Favorites),
            "sync-collections" => Some(SyncTag::Collections),
            _ => None,
        }
    }

    /// Path segment on the sync endpoint.
    pub fn segment(&self) -> &'static str {
        match self {
            SyncTag::Favorites => "favorites",
            SyncTag::Collections => "collections",
        }
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTag {
    type Err = GameMuseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
            .ok_or_else(|| GameMuseError::InvalidArgument(format!("unknown sync tag '{s}'")))
    }
}

// ==================== Mutations ====================

/// Trimmed copy of a catalog game, as the application stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRef {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub background_image: Option<String>,
    #[serde(default)]
    pub released: Option<String>,
    #[serde(default)]
    pub metacritic: Option<u32>,
}

/// An offline write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    AddFavorite {
        game: GameRef,
    },
    RemoveFavorite {
        game_id: u64,
    },
    CreateCollection {
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    UpdateCollection {
        collection_id: String,
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    DeleteCollection {
        collection_id: String,
    },
    AddGameToCollection {
        collection_id: String,
        game: GameRef,
    },
    RemoveGameFromCollection {
        collection_id: String,
        game_id: u64,
    },
}

impl Mutation {
    /// The sync tag whose queue this mutation belongs to.
    pub fn tag(&self) -> SyncTag {
        match self {
            Mutation::AddFavorite { .. } | Mutation::RemoveFavorite { .. } => SyncTag::Favorites,
            _ => SyncTag::Collections,
        }
    }
}

/// Outbox entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(u64);

impl MutationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A queued mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub tag: SyncTag,
    pub mutation: Mutation,
    /// Queue time (ms since epoch).
    pub queued_at: u64,
}

// ==================== Outbox ====================

/// Durable queue of offline mutations.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Unconfirmed mutations for `tag`, in queue order.
    async fn pending(&self, tag: SyncTag) -> Result<Vec<PendingMutation>>;

    /// Remove a mutation the backend has applied.
    async fn confirm(&self, tag: SyncTag, id: MutationId) -> Result<()>;
}

/// In-memory [`Outbox`].
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    queue: RwLock<Vec<PendingMutation>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a mutation under its own tag.
    pub async fn enqueue(&self, mutation: Mutation) -> MutationId {
        let pending = PendingMutation {
            id: MutationId::new(),
            tag: mutation.tag(),
            mutation,
            queued_at: crate::now_millis(),
        };
        let id = pending.id;
        self.queue.write().await.push(pending);
        id
    }

    /// Total queued mutations across tags.
    pub async fn len(&self) -> usize {
        self.queue.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.read().await.is_empty()
    }

    /// Every unconfirmed mutation across tags, in queue order.
    pub async fn remaining(&self) -> Vec<Mutation> {
        self.queue
            .read()
            .await
            .iter()
            .map(|p| p.mutation.clone())
            .collect()
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn pending(&self, tag: SyncTag) -> Result<Vec<PendingMutation>> {
        let queue = self.queue.read().await;
        Ok(queue.iter().filter(|p| p.tag == tag).cloned().collect())
    }

    async fn confirm(&self, tag: SyncTag, id: MutationId) -> Result<()> {
        let mut queue = self.queue.write().await;
        let index = queue
            .iter()
            .position(|p| p.tag == tag && p.id == id)
            .ok_or_not_found(format!("{tag} mutation {}", id.raw()))?;
        queue.remove(index);
        Ok(())
    }
}

// ==================== Backend ====================

/// Remote store that applies queued mutations.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn apply(&self, mutation: &PendingMutation) -> Result<()>;
}

/// [`SyncBackend`] that POSTs each mutation as JSON to
/// `{endpoint}/favorites` or `{endpoint}/collections`.
pub struct HttpSyncBackend {
    fetcher: Arc<dyn Fetcher>,
    endpoint: Url,
    retry: RetryConfig,
}

impl HttpSyncBackend {
    pub fn new(fetcher: Arc<dyn Fetcher>, endpoint: Url, retry: RetryConfig) -> Self {
        let mut endpoint = endpoint;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Self {
            fetcher,
            endpoint,
            retry,
        }
    }

    /// Target URL for a tag.
    pub fn url_for(&self, tag: SyncTag) -> Result<Url> {
        self.endpoint.join(tag.segment()).map_err(|e| {
            GameMuseError::config_with_source(format!("bad sync endpoint {}", self.endpoint), e)
        })
    }

    async fn post_once(&self, request: &Request) -> Result<()> {
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| GameMuseError::network_with_source(format!("POST {}", request.url), e))?;

        if response.ok() {
            Ok(())
        } else if response.status.is_server_error() {
            Err(GameMuseError::network(format!(
                "POST {} returned {}",
                request.url, response.status
            )))
        } else {
            Err(GameMuseError::sync(format!(
                "backend rejected mutation at {}: {}",
                request.url, response.status
            )))
        }
    }
}

#[async_trait]
impl SyncBackend for HttpSyncBackend {
    #[instrument(skip(self, mutation), fields(tag = %mutation.tag, id = mutation.id.raw()))]
    async fn apply(&self, mutation: &PendingMutation) -> Result<()> {
        let body = serde_json::to_vec(mutation).map_err(|e| {
            GameMuseError::sync_with_source(format!("cannot encode mutation {}", mutation.id.raw()), e)
        })?;
        let request = Request::post_json(self.url_for(mutation.tag)?, body);

        retry_with_backoff(&self.retry, GameMuseError::is_retryable, || {
            self.post_once(&request)
        })
        .await?;
        debug!("Mutation applied");
        Ok(())
    }
}

/// Result of handling a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The tag is not one the worker handles.
    Ignored,
    /// Every queued mutation for `tag` was applied and confirmed.
    Synced { tag: SyncTag, confirmed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamemuse_net::{HttpConfig, HttpFetcher};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn game(id: u64) -> GameRef {
        GameRef {
            id,
            name: format!("Game {id}"),
            background_image: None,
            released: Some("2015-05-18".to_string()),
            metacritic: Some(92),
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    #[test]
    fn test_tag_names() {
        assert_eq!(SyncTag::from_name("sync-favorites"), Some(SyncTag::Favorites));
        assert_eq!(
            SyncTag::from_name("sync-collections"),
            Some(SyncTag::Collections)
        );
        assert_eq!(SyncTag::from_name("sync-everything"), None);
        assert!("sync-everything".parse::<SyncTag>().is_err());
        assert_eq!(SyncTag::Collections.to_string(), "sync-collections");
    }

    #[test]
    fn test_mutation_wire_format() {
        let mutation = Mutation::RemoveGameFromCollection {
            collection_id: "c1".to_string(),
            game_id: 3498,
        };
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["op"], "remove_game_from_collection");
        assert_eq!(value["game_id"], 3498);
        assert_eq!(mutation.tag(), SyncTag::Collections);
        assert_eq!(
            Mutation::AddFavorite { game: game(1) }.tag(),
            SyncTag::Favorites
        );
    }

    #[tokio::test]
    async fn test_memory_outbox_filters_and_confirms() {
        let outbox = MemoryOutbox::new();
        let fav = outbox.enqueue(Mutation::AddFavorite { game: game(1) }).await;
        outbox
            .enqueue(Mutation::DeleteCollection {
                collection_id: "c1".to_string(),
            })
            .await;

        let favorites = outbox.pending(SyncTag::Favorites).await.unwrap();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].id, fav);

        outbox.confirm(SyncTag::Favorites, fav).await.unwrap();
        assert_eq!(outbox.len().await, 1);
        assert!(outbox.confirm(SyncTag::Favorites, fav).await.is_err());
        assert_eq!(
            outbox.remaining().await,
            vec![Mutation::DeleteCollection {
                collection_id: "c1".to_string()
            }]
        );
    }

    #[test]
    fn test_endpoint_gets_trailing_slash() {
        let fetcher = Arc::new(HttpFetcher::new(&HttpConfig::default()).unwrap());
        let backend = HttpSyncBackend::new(
            fetcher,
            Url::parse("https://sync.example.com/v1").unwrap(),
            RetryConfig::none(),
        );
        assert_eq!(
            backend.url_for(SyncTag::Favorites).unwrap().as_str(),
            "https://sync.example.com/v1/favorites"
        );
    }

    #[tokio::test]
    async fn test_http_backend_posts_mutation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/favorites"))
            .and(body_partial_json(serde_json::json!({
                "tag": "sync-favorites",
                "mutation": {"op": "remove_favorite", "game_id": 7}
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let outbox = MemoryOutbox::new();
        outbox.enqueue(Mutation::RemoveFavorite { game_id: 7 }).await;
        let pending = outbox.pending(SyncTag::Favorites).await.unwrap();

        let backend = HttpSyncBackend::new(
            Arc::new(HttpFetcher::new(&HttpConfig::default()).unwrap()),
            Url::parse(&server.uri()).unwrap(),
            RetryConfig::none(),
        );
        backend.apply(&pending[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_backend_retries_server_errors_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/favorites"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpSyncBackend::new(
            Arc::new(HttpFetcher::new(&HttpConfig::default()).unwrap()),
            Url::parse(&server.uri()).unwrap(),
            fast_retry(3),
        );
        let outbox = MemoryOutbox::new();
        outbox
            .enqueue(Mutation::DeleteCollection {
                collection_id: "c1".to_string(),
            })
            .await;
        outbox.enqueue(Mutation::RemoveFavorite { game_id: 7 }).await;

        let collection = &outbox.pending(SyncTag::Collections).await.unwrap()[0];
        let err = backend.apply(collection).await.unwrap_err();
        assert_eq!(err.category(), "network");

        let favorite = &outbox.pending(SyncTag::Favorites).await.unwrap()[0];
        let err = backend.apply(favorite).await.unwrap_err();
        assert_eq!(err.category(), "sync");
    }
}
