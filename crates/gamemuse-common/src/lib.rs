//! # GameMuse Common
//!
//! Shared plumbing for the GameMuse offline worker crates: the error type
//! returned by every platform collaborator (cache stores, outbox, sync
//! backends, client and notification hosts), logging setup, and retry with
//! backoff.

use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, RetryConfig};

/// Boxed underlying cause carried by [`GameMuseError`] variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by GameMuse collaborators.
#[derive(Error, Debug)]
pub enum GameMuseError {
    /// The remote side could not be reached or answered with a server error.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The durable cache failed (quota, unavailable store, corrupt rows).
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A sync backend refused a mutation.
    #[error("Sync error: {message}")]
    Sync {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A window could not be opened, focused, or navigated.
    #[error("Client error: {message}")]
    Client {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The worker configuration is unusable.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

macro_rules! constructors {
    ($($variant:ident => $plain:ident, $with_source:ident;)*) => {
        impl GameMuseError {
            $(
                pub fn $plain(message: impl Into<String>) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: None,
                    }
                }

                pub fn $with_source<E>(message: impl Into<String>, source: E) -> Self
                where
                    E: std::error::Error + Send + Sync + 'static,
                {
                    Self::$variant {
                        message: message.into(),
                        source: Some(Box::new(source)),
                    }
                }
            )*
        }
    };
}

constructors! {
    Network => network, network_with_source;
    Storage => storage, storage_with_source;
    Sync => sync, sync_with_source;
    Client => client, client_with_source;
    Config => config, config_with_source;
}

impl GameMuseError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GameMuseError::Network { .. } | GameMuseError::Io(_))
    }

    /// Short, stable name for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            GameMuseError::Network { .. } => "network",
            GameMuseError::Storage { .. } => "storage",
            GameMuseError::Sync { .. } => "sync",
            GameMuseError::Client { .. } => "client",
            GameMuseError::Config { .. } => "config",
            GameMuseError::Io(_) => "io",
            GameMuseError::NotFound(_) => "not_found",
            GameMuseError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

pub type Result<T> = std::result::Result<T, GameMuseError>;

/// Turn a missing value into [`GameMuseError::NotFound`].
pub trait OptionExt<T> {
    fn ok_or_not_found(self, what: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, what: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| GameMuseError::NotFound(what.into()))
    }
}
