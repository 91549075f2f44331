//! SQLite-backed [`CacheStore`] that survives worker restarts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gamemuse_common::{GameMuseError, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStore, RequestKey};

/// Database schema version
const SCHEMA_VERSION: i32 = 1;

fn storage(context: &str, e: impl std::error::Error + Send + Sync + 'static) -> GameMuseError {
    GameMuseError::storage_with_source(context.to_string(), e)
}

/// Durable cache store in a single SQLite file.
///
/// Calls run on the blocking pool; the connection is shared behind a mutex,
/// so each operation is serialized and `put_all` runs in one transaction.
#[derive(Clone)]
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| storage("Failed to open cache database", e))?;
        info!(path = %path.display(), "Opened cache database");
        Self::from_connection(conn)
    }

    /// A store that lives only as long as the process.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| storage("Failed to open cache database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(|e| storage("Failed to enable foreign keys", e))?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| GameMuseError::storage("cache database lock poisoned"))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| storage("Cache database task failed", e))?
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_generations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            generation INTEGER NOT NULL REFERENCES cache_generations(id) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (generation, method, url)
        );
        "#,
    )
    .map_err(|e| storage("Failed to create schema", e))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| storage("Failed to read schema version", e))?;

    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )
            .map_err(|e| storage("Failed to record schema version", e))?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(GameMuseError::storage(format!(
                "cache database schema {v} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

fn generation_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM cache_generations WHERE name = ?",
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| storage("Failed to look up generation", e))
}

fn open_generation(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)",
        params![name, crate::now_millis() as i64],
    )
    .map_err(|e| storage("Failed to create generation", e))?;
    generation_id(conn, name)?
        .ok_or_else(|| GameMuseError::storage(format!("generation '{name}' vanished")))
}

fn insert_entry(tx: &Transaction<'_>, generation: i64, entry: &CacheEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)
        .map_err(|e| storage("Failed to encode headers", e))?;
    tx.execute(
        "INSERT OR REPLACE INTO cache_entries
            (generation, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            generation,
            entry.key.method,
            entry.key.url,
            entry.status,
            headers,
            entry.body,
            entry.cached_at as i64,
        ],
    )
    .map_err(|e| storage("Failed to write cache entry", e))?;
    Ok(())
}

fn write_entries(conn: &mut Connection, name: &str, entries: &[CacheEntry]) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| storage("Failed to begin transaction", e))?;
    let generation = open_generation(&tx, name)?;
    for entry in entries {
        insert_entry(&tx, generation, entry)?;
    }
    tx.commit()
        .map_err(|e| storage("Failed to commit cache entries", e))
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn generations(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM cache_generations ORDER BY id")
                .map_err(|e| storage("Failed to list generations", e))?;
            let names = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| storage("Failed to list generations", e))?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(|e| storage("Failed to read generation row", e))?;
            Ok(names)
        })
        .await
    }

    async fn open(&self, generation: &str) -> Result<()> {
        let name = generation.to_string();
        self.with_conn(move |conn| open_generation(conn, &name).map(|_| ()))
            .await
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool> {
        let name = generation.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM cache_generations WHERE name = ?", params![name])
                .map_err(|e| storage("Failed to delete generation", e))?;
            debug!(generation = %name, deleted, "Deleted generation");
            Ok(deleted > 0)
        })
        .await
    }

    async fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let name = generation.to_string();
        let key = key.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT e.status, e.headers, e.body, e.cached_at
                     FROM cache_entries e
                     JOIN cache_generations g ON g.id = e.generation
                     WHERE g.name = ? AND e.method = ? AND e.url = ?",
                    params![name, key.method, key.url],
                    |row| {
                        Ok((
                            row.get::<_, u16>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| storage("Failed to read cache entry", e))?;

            row.map(|(status, headers, body, cached_at)| {
                let headers = serde_json::from_str(&headers)
                    .map_err(|e| storage("Corrupt cached headers", e))?;
                Ok(CacheEntry {
                    key,
                    status,
                    headers,
                    body,
                    cached_at: cached_at.max(0) as u64,
                })
            })
            .transpose()
        })
        .await
    }

    async fn put(&self, generation: &str, entry: CacheEntry) -> Result<()> {
        let name = generation.to_string();
        self.with_conn(move |conn| write_entries(conn, &name, std::slice::from_ref(&entry)))
            .await
    }

    async fn put_all(&self, generation: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let name = generation.to_string();
        self.with_conn(move |conn| write_entries(conn, &name, &entries))
            .await
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
        let name = generation.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT e.method, e.url
                     FROM cache_entries e
                     JOIN cache_generations g ON g.id = e.generation
                     WHERE g.name = ?
                     ORDER BY e.url",
                )
                .map_err(|e| storage("Failed to list keys", e))?;
            let keys = stmt
                .query_map(params![name], |row| {
                    Ok(RequestKey {
                        method: row.get(0)?,
                        url: row.get(1)?,
                    })
                })
                .map_err(|e| storage("Failed to list keys", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| storage("Failed to read key row", e))?;
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use url::Url;

    fn entry(url: &str, body: &str) -> CacheEntry {
        CacheEntry {
            key: RequestKey::new(&Method::GET, &Url::parse(url).unwrap()),
            status: 200,
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("x-cache-timestamp".into(), "1700000000000".into()),
            ],
            body: body.as_bytes().to_vec(),
            cached_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_preserves_headers() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        let original = entry("https://api.rawg.io/api/games?page=1", r#"{"count":1}"#);
        store.put("gamemuse-api-v1", original.clone()).await.unwrap();

        let loaded = store
            .get("gamemuse-api-v1", &original.key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, original);
        assert!(store
            .get("gamemuse-v1", &original.key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_generation_cascades() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.open("gamemuse-v0").await.unwrap();
        store
            .put_all(
                "gamemuse-v0",
                vec![
                    entry("http://localhost:3000/", "<html>"),
                    entry("http://localhost:3000/index.html", "<html>"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.keys("gamemuse-v0").await.unwrap().len(), 2);

        assert!(store.delete_generation("gamemuse-v0").await.unwrap());
        assert!(store.generations().await.unwrap().is_empty());
        assert!(store.keys("gamemuse-v0").await.unwrap().is_empty());
        assert!(!store.delete_generation("gamemuse-v0").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_all_rolls_back_on_failed_insert() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_broken BEFORE INSERT ON cache_entries
                 WHEN NEW.url LIKE '%broken%'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let err = store
            .put_all(
                "gamemuse-v1",
                vec![
                    entry("http://localhost:3000/", "<html>"),
                    entry("http://localhost:3000/broken.css", "body{}"),
                    entry("http://localhost:3000/index.html", "<html>"),
                ],
            )
            .await
            .unwrap_err();

        assert_eq!(err.category(), "storage");
        assert!(store.keys("gamemuse-v1").await.unwrap().is_empty());
        assert!(store.generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_headers_with_non_utf8_bytes_roundtrip() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        let mut cached = entry("http://localhost:3000/manifest.json", "{}");
        cached
            .headers
            .push(("content-disposition".into(), b"inline; filename=caf\xe9".to_vec()));
        store.put("gamemuse-v1", cached.clone()).await.unwrap();

        let loaded = store.get("gamemuse-v1", &cached.key).await.unwrap().unwrap();
        assert_eq!(loaded.headers, cached.headers);
    }

    #[tokio::test]
    async fn test_generations_oldest_first() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.open("gamemuse-v1").await.unwrap();
        store.open("gamemuse-api-v1").await.unwrap();
        store.open("gamemuse-v1").await.unwrap();

        assert_eq!(
            store.generations().await.unwrap(),
            vec!["gamemuse-v1", "gamemuse-api-v1"]
        );
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite3");
        let cached = entry("http://localhost:3000/manifest.json", "{}");

        {
            let store = SqliteCacheStore::open(&path).unwrap();
            store.put("gamemuse-v1", cached.clone()).await.unwrap();
        }

        let store = SqliteCacheStore::open(&path).unwrap();
        let hit = store.match_any(&cached.key).await.unwrap().unwrap();
        assert_eq!(hit.body, b"{}");
    }
}
