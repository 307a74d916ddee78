//! Embedding cache: snapshot fast path, bounded-parallel cold build,
//! atomic persistence.
//!
//! The cache maps every embedded document of a corpus to a unit-normalized
//! vector plus the display metadata a result row needs, so a search never
//! touches the database until final enrichment. It is rebuilt wholesale —
//! entries are never mutated in place — and published as a fresh
//! `Arc<Vec<CacheEntry>>` so concurrent readers can never observe a
//! half-built list.
//!
//! # Build order
//!
//! 1. Snapshot fast path: parse `<corpus>.vectors.json`, defensively
//!    re-normalize every vector, drop empty/zero-norm entries, return
//!    without touching the document or blob store.
//! 2. Cold build: select documents with a non-null embedding blob ref,
//!    fetch and decode each blob with a fixed-size worker pool, normalize,
//!    drop failures.
//! 3. Persist the result back to the snapshot (best-effort, atomic
//!    temp-file + rename).
//!
//! The snapshot is advisory: absence or corruption silently falls back to
//! the cold build.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::blobstore::BlobStore;
use crate::config::CacheConfig;
use crate::db;
use crate::embedding::{blob_to_vec, normalize_l2};

/// One cached document: identity, display fields, unit vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub title: Option<String>,
    pub published_at: Option<String>,
    pub reference: Option<String>,
    pub source_url: Option<String>,
    pub vector: Vec<f32>,
}

/// The snapshot file for a corpus.
pub fn snapshot_path(cache: &CacheConfig, corpus: &str) -> PathBuf {
    cache.snapshot_dir.join(format!("{}.vectors.json", corpus))
}

/// Build the cache for a corpus: snapshot fast path, then cold build.
pub async fn build_cache(
    cache_cfg: &CacheConfig,
    pool: &SqlitePool,
    store: Arc<dyn BlobStore>,
    corpus: &str,
) -> Result<Arc<Vec<CacheEntry>>> {
    let snapshot = snapshot_path(cache_cfg, corpus);

    if let Some(entries) = load_snapshot(&snapshot) {
        tracing::debug!(corpus, entries = entries.len(), "cache loaded from snapshot");
        return Ok(Arc::new(entries));
    }

    let entries = cold_build(cache_cfg, pool, store, corpus).await?;

    // Best-effort persist; a failed write must not fail the build.
    if let Err(e) = save_snapshot(&snapshot, &entries) {
        tracing::warn!(corpus, error = %e, "failed to persist cache snapshot");
    }

    Ok(Arc::new(entries))
}

/// Load and sanitize a snapshot. `None` on absence or corruption.
pub fn load_snapshot(path: &Path) -> Option<Vec<CacheEntry>> {
    let content = std::fs::read_to_string(path).ok()?;
    let raw: Vec<CacheEntry> = serde_json::from_str(&content).ok()?;

    // A previously-stored vector might not be unit length; re-normalize and
    // drop anything without a direction.
    let entries: Vec<CacheEntry> = raw
        .into_iter()
        .filter_map(|mut entry| {
            entry.vector = normalize_l2(&entry.vector)?;
            Some(entry)
        })
        .collect();

    Some(entries)
}

/// Persist entries atomically: write a temp file in the same directory,
/// then rename over the target so a crash never leaves a torn snapshot.
pub fn save_snapshot(path: &Path, entries: &[CacheEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string(entries)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())
        .with_context(|| format!("Failed to write snapshot temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move snapshot into place at {}", path.display()))?;
    Ok(())
}

/// Remove a corpus snapshot. Absence is fine.
pub fn remove_snapshot(cache_cfg: &CacheConfig, corpus: &str) -> Result<bool> {
    let path = snapshot_path(cache_cfg, corpus);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove snapshot {}", path.display())),
    }
}

/// A document row eligible for the cache (embedding blob ref present).
struct PendingEntry {
    id: i64,
    title: Option<String>,
    published_at: Option<String>,
    reference: Option<String>,
    source_url: Option<String>,
    embedding_key: String,
}

/// Fetch and decode every embedded document with a bounded worker pool.
async fn cold_build(
    cache_cfg: &CacheConfig,
    pool: &SqlitePool,
    store: Arc<dyn BlobStore>,
    corpus: &str,
) -> Result<Vec<CacheEntry>> {
    let table = db::docs_table(corpus);

    let rows = sqlx::query(&format!(
        "SELECT id, title, published_at, reference, source_url, embedding_key \
         FROM {table} WHERE embedding_key IS NOT NULL",
    ))
    .fetch_all(pool)
    .await?;

    let pending: Vec<PendingEntry> = rows
        .iter()
        .filter_map(|row| {
            let embedding_key: Option<String> = row.get("embedding_key");
            Some(PendingEntry {
                id: row.get("id"),
                title: row.get("title"),
                published_at: row.get("published_at"),
                reference: row.get("reference"),
                source_url: row.get("source_url"),
                embedding_key: embedding_key?,
            })
        })
        .collect();

    let total = pending.len();
    let semaphore = Arc::new(Semaphore::new(cache_cfg.fetch_workers));
    let fetch_timeout = Duration::from_secs(cache_cfg.fetch_timeout_secs);
    let mut tasks: JoinSet<Option<CacheEntry>> = JoinSet::new();

    for item in pending {
        let store = store.clone();
        let semaphore = semaphore.clone();

        tasks.spawn(async move {
            // Closed only if the pool itself is dropped mid-build.
            let _permit = semaphore.acquire_owned().await.ok()?;
            fetch_entry(store.as_ref(), item, fetch_timeout).await
        });
    }

    let mut entries: Vec<CacheEntry> = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(entry)) => {
                // Each id is the primary key of its own fetch task, so this
                // is a structural guarantee rather than a filter.
                if seen.insert(entry.id) {
                    entries.push(entry);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(corpus, error = %e, "cache fetch task panicked");
            }
        }
    }

    // Deterministic base order; the ranker's stable sort keys off it.
    entries.sort_by_key(|e| e.id);

    tracing::info!(
        corpus,
        cached = entries.len(),
        dropped = total - entries.len(),
        "cold cache build finished"
    );

    Ok(entries)
}

/// Fetch one embedding blob and turn it into a cache entry.
///
/// Every failure path — unresolvable key, timeout, transport error, absent
/// blob, corrupt bytes, zero-norm vector — drops this one entry and never
/// the build.
async fn fetch_entry(
    store: &dyn BlobStore,
    item: PendingEntry,
    fetch_timeout: Duration,
) -> Option<CacheEntry> {
    let url = store.resolve_url(&item.embedding_key)?;

    let bytes = match tokio::time::timeout(fetch_timeout, store.fetch(&url)).await {
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Ok(None)) => {
            tracing::debug!(id = item.id, key = %item.embedding_key, "embedding blob absent");
            return None;
        }
        Ok(Err(e)) => {
            tracing::warn!(id = item.id, error = %e, "embedding fetch failed");
            return None;
        }
        Err(_) => {
            tracing::warn!(id = item.id, "embedding fetch timed out");
            return None;
        }
    };

    let vector = normalize_l2(&blob_to_vec(&bytes)?)?;

    Some(CacheEntry {
        id: item.id,
        title: item.title,
        published_at: item.published_at,
        reference: item.reference,
        source_url: item.source_url,
        vector,
    })
}

/// Run `cache warm`: force a cold rebuild and persist a fresh snapshot.
pub async fn run_cache_warm(config: &crate::config::Config, corpus: &str) -> Result<()> {
    let corpus = config.corpus(corpus)?;
    let pool = db::connect(config).await?;
    let store = crate::blobstore::create_store(&config.storage, &config.cache)?;

    // Drop the snapshot first so the build cannot take the fast path.
    remove_snapshot(&config.cache, &corpus)?;
    let entries = build_cache(&config.cache, &pool, store, &corpus).await?;

    println!(
        "Warmed cache for '{}': {} entries -> {}",
        corpus,
        entries.len(),
        snapshot_path(&config.cache, &corpus).display()
    );

    pool.close().await;
    Ok(())
}

/// Run `cache invalidate`: drop the corpus snapshot.
///
/// A running server keeps serving its in-memory copy until its own
/// invalidation or restart; the next warm-up rebuilds from the stores.
pub async fn run_cache_invalidate(config: &crate::config::Config, corpus: &str) -> Result<()> {
    let corpus = config.corpus(corpus)?;
    if remove_snapshot(&config.cache, &corpus)? {
        println!("Removed snapshot for '{}'", corpus);
    } else {
        println!("No snapshot for '{}'", corpus);
    }
    Ok(())
}

/// Run `cache status`: report snapshot presence and entry counts.
pub async fn run_cache_status(config: &crate::config::Config) -> Result<()> {
    for corpus in &config.corpora {
        let path = snapshot_path(&config.cache, corpus);
        match load_snapshot(&path) {
            Some(entries) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                println!(
                    "  {:<16} {} entries, {} bytes ({})",
                    corpus,
                    entries.len(),
                    size,
                    path.display()
                );
            }
            None => println!("  {:<16} no snapshot", corpus),
        }
    }
    Ok(())
}
