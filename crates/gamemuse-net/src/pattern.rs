//! URL matchers used to route requests to a fetch strategy.

use serde::{Deserialize, Serialize};
use url::Url;

/// A test applied to the full serialized URL.
///
/// Serialized as a single-key object, e.g. `{"contains": "api.rawg.io/api"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlPattern {
    Exact(String),
    Prefix(String),
    Contains(String),
}

impl UrlPattern {
    pub fn exact(url: impl Into<String>) -> Self {
        Self::Exact(url.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn contains(needle: impl Into<String>) -> Self {
        Self::Contains(needle.into())
    }

    /// The string the pattern tests for.
    pub fn needle(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Prefix(s) | Self::Contains(s) => s,
        }
    }

    pub fn matches(&self, url: &Url) -> bool {
        self.matches_str(url.as_str())
    }

    pub fn matches_str(&self, url: &str) -> bool {
        match self {
            Self::Exact(s) => url == s,
            Self::Prefix(s) => url.starts_with(s.as_str()),
            Self::Contains(s) => url.contains(s.as_str()),
        }
    }
}
