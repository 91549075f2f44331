//! Cache generations, entries, and the durable store seam.

use std::fmt;

use async_trait::async_trait;
use gamemuse_common::{GameMuseError, Result};
use gamemuse_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use url::Url;

// ==================== Keys ====================

/// Identity of a cached request: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &http::Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A captured response snapshot stored under a [`RequestKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,

    /// Response status.
    pub status: u16,

    /// Response headers as raw value bytes, in order, duplicates preserved.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` for `key`. Header values are kept byte for byte.
    pub fn capture(key: RequestKey, response: &Response, cached_at: u64) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            key,
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at,
        }
    }

    /// Set (replace) a header on the stored snapshot.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        let value: String = value.into();
        self.headers.push((name.to_string(), value.into_bytes()));
        self
    }

    /// A stored header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Rebuild a [`Response`] from the snapshot.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.key.url).map_err(|e| {
            GameMuseError::storage_with_source(format!("corrupt cache key {}", self.key), e)
        })?;
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            GameMuseError::storage_with_source(format!("corrupt status for {}", self.key), e)
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => warn!(key = %self.key, header = %name, "Dropping unparsable cached header"),
            }
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone().into(),
        })
    }
}

// ==================== Store ====================

/// Durable key-value store for cached responses, addressed by
/// `(generation, key)`.
///
/// Implementations must make each single-key operation atomic and
/// [`put_all`](CacheStore::put_all) all-or-nothing.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Generation names, oldest first.
    async fn generations(&self) -> Result<Vec<String>>;

    /// Create a generation if it does not exist.
    async fn open(&self, generation: &str) -> Result<()>;

    /// Delete a generation and all of its entries.
    async fn delete_generation(&self, generation: &str) -> Result<bool>;

    /// Look up an entry in one generation.
    async fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous one for the same key.
    async fn put(&self, generation: &str, entry: CacheEntry) -> Result<()>;

    /// Store every entry or none of them.
    async fn put_all(&self, generation: &str, entries: Vec<CacheEntry>) -> Result<()>;

    /// Keys stored in one generation.
    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>>;

    /// Look up an entry across all generations, oldest generation first.
    async fn match_any(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
        for generation in self.generations().await? {
            if let Some(entry) = self.get(&generation, key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

/// One named generation held in memory.
#[derive(Debug, Default)]
struct Generation {
    name: String,
    entries: HashMap<RequestKey, CacheEntry>,
}

/// In-memory [`CacheStore`]; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    generations: RwLock<Vec<Generation>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(generations: &[Generation], name: &str) -> Option<usize> {
        generations.iter().position(|g| g.name == name)
    }

    fn open_mut<'a>(generations: &'a mut Vec<Generation>, name: &str) -> &'a mut Generation {
        let index = match Self::position(generations, name) {
            Some(index) => index,
            None => {
                generations.push(Generation {
                    name: name.to_string(),
                    entries: HashMap::new(),
                });
                generations.len() - 1
            }
        };
        &mut generations[index]
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn generations(&self) -> Result<Vec<String>> {
        let generations = self.generations.read().await;
        Ok(generations.iter().map(|g| g.name.clone()).collect())
    }

    async fn open(&self, generation: &str) -> Result<()> {
        let mut generations = self.generations.write().await;
        Self::open_mut(&mut generations, generation);
        Ok(())
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool> {
        let mut generations = self.generations.write().await;
        match Self::position(&generations, generation) {
            Some(index) => {
                generations.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let generations = self.generations.read().await;
        Ok(Self::position(&generations, generation)
            .and_then(|index| generations[index].entries.get(key).cloned()))
    }

    async fn put(&self, generation: &str, entry: CacheEntry) -> Result<()> {
        let mut generations = self.generations.write().await;
        Self::open_mut(&mut generations, generation)
            .entries
            .insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn put_all(&self, generation: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut generations = self.generations.write().await;
        let target = Self::open_mut(&mut generations, generation);
        for entry in entries {
            target.entries.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
        let generations = self.generations.read().await;
        Ok(Self::position(&generations, generation)
            .map(|index| generations[index].entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}
