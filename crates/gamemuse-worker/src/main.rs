//! Command-line driver for the GameMuse offline worker.
//!
//! Each invocation runs the lifecycle events it needs against the durable
//! cache, so the cache can be inspected and exercised without a browser.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the app shell
//! gamemuse-worker install
//!
//! # Install, activate, then answer requests
//! gamemuse-worker fetch https://api.rawg.io/api/games?page=1 /index.html
//!
//! # Replay queued mutations
//! gamemuse-worker sync sync-favorites --queue pending.json
//!
//! # Show what is cached
//! gamemuse-worker generations
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gamemuse_common::logging::{init_logging, LogConfig, LogFormat};
use gamemuse_net::{HttpFetcher, Request};
use gamemuse_sw::{
    CacheStore, MemoryOutbox, Mutation, OfflineController, SqliteCacheStore, WorkerConfig,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "gamemuse-worker")]
#[command(about = "Offline cache worker for the GameMuse app")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache database location
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Log format: pretty, compact, or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the static manifest
    Install,

    /// Install (or reuse a cached install), then evict stale generations and
    /// claim clients
    Activate,

    /// Install (or reuse a cached install) and activate, then answer each
    /// request
    Fetch {
        /// Absolute URLs or paths relative to the origin
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show a notification for a push payload
    Push {
        /// Payload JSON, e.g. '{"title":"T","body":"B","url":"/game/5"}'
        payload: String,
        /// Also simulate the user clicking the notification
        #[arg(long)]
        click: bool,
    },

    /// Replay queued mutations for a sync tag
    Sync {
        /// Sync tag, e.g. sync-favorites
        tag: String,
        /// JSON array of mutations to queue before syncing
        #[arg(short, long)]
        queue: Option<PathBuf>,
    },

    /// List cache generations and their entry counts
    Generations,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format))?;

    let mut config = match &cli.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    let store = Arc::new(SqliteCacheStore::open(&config.store_path)?);

    match cli.command {
        Commands::Generations => list_generations(store.as_ref()).await?,
        Commands::Sync { tag, queue } => {
            let outbox = Arc::new(MemoryOutbox::new());
            if let Some(path) = &queue {
                for mutation in read_queue(path)? {
                    outbox.enqueue(mutation).await;
                }
            }
            let controller = controller(config, store)?
                .outbox(outbox.clone())
                .build()?;
            let result = controller.handle_sync(&tag).await;
            if let Some(path) = &queue {
                write_queue(path, &outbox.remaining().await)?;
            }
            println!("{:?}", result?);
        }
        Commands::Push { payload, click } => {
            let controller = controller(config, store)?.build()?;
            match controller.handle_push(Some(payload.as_bytes())).await {
                Some(notification) => {
                    println!("{}", serde_json::to_string_pretty(&notification)?);
                    if click {
                        let outcome = controller.handle_notification_click(&notification).await?;
                        println!("{:?} {} ({:?})", outcome.action, outcome.target, outcome.client_id);
                    }
                }
                None => return Err("push payload rejected".into()),
            }
        }
        Commands::Install => {
            let controller = controller(config, store)?.build()?;
            let count = controller.install().await?;
            println!("Cached {count} static assets");
        }
        Commands::Activate => {
            let controller = controller(config, store)?.build()?;
            ready(&controller).await?;
            let report = controller.activate().await?;
            println!(
                "Deleted {:?}; claimed {} clients",
                report.deleted, report.claimed
            );
        }
        Commands::Fetch { urls } => {
            let controller = controller(config, store)?.build()?;
            ready(&controller).await?;
            controller.activate().await?;

            for raw in urls {
                let url = controller.config().resolve(&raw)?;
                let outcome = controller.handle_fetch(Request::get(url.clone())).await?;
                println!(
                    "{:<8} {} {} ({} bytes)",
                    format!("{:?}", outcome.source),
                    outcome.response.status,
                    url,
                    outcome.response.body.len()
                );
            }
            controller.settle().await;
        }
    }

    info!("Done");
    Ok(())
}

fn controller(
    config: WorkerConfig,
    store: Arc<SqliteCacheStore>,
) -> Result<gamemuse_sw::OfflineControllerBuilder, Box<dyn std::error::Error>> {
    let fetcher = Arc::new(HttpFetcher::new(&config.http)?);
    Ok(OfflineController::builder(config)
        .store(store)
        .fetcher(fetcher))
}

/// Reuse a complete install from the store; precache only when it is missing.
async fn ready(controller: &OfflineController) -> Result<(), Box<dyn std::error::Error>> {
    if !controller.resume().await? {
        controller.install().await?;
    }
    Ok(())
}

fn read_queue(path: &Path) -> Result<Vec<Mutation>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Replace the queue file with the mutations still awaiting confirmation.
fn write_queue(path: &Path, remaining: &[Mutation]) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(path, serde_json::to_string_pretty(remaining)?)?;
    Ok(())
}

async fn list_generations(store: &dyn CacheStore) -> Result<(), Box<dyn std::error::Error>> {
    let generations = store.generations().await?;
    if generations.is_empty() {
        println!("No cache generations");
    }
    for generation in generations {
        let keys = store.keys(&generation).await?;
        println!("{generation}: {} entries", keys.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamemuse_sw::{CacheEntry, RequestKey, WorkerState};
    use std::io::Write;

    #[test]
    fn test_cli_parses_fetch_urls() {
        let cli = Cli::try_parse_from([
            "gamemuse-worker",
            "--verbose",
            "fetch",
            "/index.html",
            "https://api.rawg.io/api/games",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Fetch { urls } => assert_eq!(urls.len(), 2),
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["gamemuse-worker", "--log-format", "xml", "install"]).is_err());
    }

    #[test]
    fn test_read_queue() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"op":"remove_favorite","game_id":3498}},
               {{"op":"delete_collection","collection_id":"abc"}}]"#
        )
        .unwrap();

        let queue = read_queue(file.path()).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0], Mutation::RemoveFavorite { game_id: 3498 });
    }

    #[test]
    fn test_write_queue_keeps_only_remaining() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let remaining = vec![Mutation::DeleteCollection {
            collection_id: "abc".to_string(),
        }];

        write_queue(file.path(), &remaining).unwrap();
        assert_eq!(read_queue(file.path()).unwrap(), remaining);

        write_queue(file.path(), &[]).unwrap();
        assert!(read_queue(file.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ready_reuses_complete_cached_install() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            store_path: dir.path().join("cache.sqlite3"),
            ..Default::default()
        };
        let store = Arc::new(SqliteCacheStore::open(&config.store_path).unwrap());
        let entries = config
            .manifest_urls()
            .unwrap()
            .into_iter()
            .map(|url| CacheEntry {
                key: RequestKey::for_request(&Request::get(url.clone())),
                status: 200,
                headers: Vec::new(),
                body: url.path().as_bytes().to_vec(),
                cached_at: 0,
            })
            .collect();
        store.put_all(&config.static_cache, entries).await.unwrap();

        let controller = controller(config, store).unwrap().build().unwrap();
        ready(&controller).await.unwrap();
        assert_eq!(controller.state(), WorkerState::Installed);
    }
}
