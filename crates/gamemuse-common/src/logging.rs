//! `tracing` subscriber setup for the worker binary.
//!
//! Output goes to stderr so command output on stdout stays machine-readable.

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::GameMuseError;

/// Directives appended to every filter; HTTP and SQLite internals are noisy.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,reqwest=warn,rusqlite=warn";

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-oriented.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = GameMuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("pretty") {
            Ok(Self::Pretty)
        } else if s.eq_ignore_ascii_case("compact") {
            Ok(Self::Compact)
        } else if s.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else {
            Err(GameMuseError::InvalidArgument(format!(
                "log format must be pretty, compact or json, got '{s}'"
            )))
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when neither `directives` nor `RUST_LOG` is set.
    pub level: Level,
    pub format: LogFormat,
    /// Explicit filter, e.g. `gamemuse_sw=debug`; overrides `RUST_LOG`.
    pub directives: Option<String>,
    /// Log span close events with their durations.
    pub span_timings: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            directives: None,
            span_timings: false,
        }
    }
}

impl LogConfig {
    /// Debug level with span timings, for `--verbose`.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            span_timings: true,
            ..Default::default()
        }
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        let base = match &self.directives {
            Some(directives) => directives.clone(),
            None => std::env::var(EnvFilter::DEFAULT_ENV)
                .unwrap_or_else(|_| self.level.to_string().to_ascii_lowercase()),
        };
        EnvFilter::try_new(format!("{base},{QUIET_DEPENDENCIES}"))
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string().to_ascii_lowercase()))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LogConfig) -> crate::Result<()> {
    let spans = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(spans);
    let registry = tracing_subscriber::registry().with(config.filter());

    let result = match config.format {
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
        LogFormat::Json => registry.with(layer.json()).try_init(),
    };
    result.map_err(|e| GameMuseError::config_with_source("cannot install log subscriber", e))
}
