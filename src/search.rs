//! Semantic search over the embedding cache.
//!
//! Scoring is a dot product against pre-normalized vectors (equal to cosine
//! similarity), followed by threshold filtering, a stable descending sort,
//! and truncation. The only database touch is the final display-enrichment
//! lookup, batched over the surviving ids.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::blobstore;
use crate::cache::{self, CacheEntry};
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::{SearchHit, SearchResponse};

/// Score and rank cache entries against a unit query vector.
///
/// - an empty cache or a zero-norm/empty query yields no results
/// - entries scoring strictly below `threshold` are discarded
/// - ties keep cache order (stable sort, no secondary key)
/// - `limit <= 0` means no limit
pub fn rank<'a>(
    query: &[f32],
    entries: &'a [CacheEntry],
    threshold: f32,
    limit: i64,
) -> Vec<(&'a CacheEntry, f32)> {
    if entries.is_empty() || embedding::normalize_l2(query).is_none() {
        return Vec::new();
    }

    let mut scored: Vec<(&CacheEntry, f32)> = entries
        .iter()
        .map(|entry| (entry, embedding::dot(query, &entry.vector)))
        .filter(|(_, score)| *score >= threshold)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if limit > 0 {
        scored.truncate(limit as usize);
    }
    scored
}

/// Rank against a cache and enrich the survivors from the document store.
pub async fn search_corpus(
    pool: &SqlitePool,
    corpus: &str,
    entries: &[CacheEntry],
    query: &[f32],
    limit: i64,
    threshold: f32,
) -> Result<SearchResponse> {
    let ranked = rank(query, entries, threshold, limit);
    if ranked.is_empty() {
        return Ok(SearchResponse::empty());
    }

    let fresh = fetch_display_rows(pool, corpus, ranked.iter().map(|(e, _)| e.id)).await?;

    let results: Vec<SearchHit> = ranked
        .into_iter()
        .map(|(entry, score)| {
            // Prefer the freshly resolved row; the cache copy may predate a
            // metadata correction.
            match fresh.get(&entry.id) {
                Some(row) => SearchHit {
                    id: entry.id,
                    score,
                    title: row.title.clone(),
                    published_at: row.published_at.clone(),
                    reference: row.reference.clone(),
                    source_url: row.source_url.clone(),
                },
                None => SearchHit {
                    id: entry.id,
                    score,
                    title: entry.title.clone(),
                    published_at: entry.published_at.clone(),
                    reference: entry.reference.clone(),
                    source_url: entry.source_url.clone(),
                },
            }
        })
        .collect();

    let count = results.len();
    Ok(SearchResponse { results, count })
}

struct DisplayRow {
    title: Option<String>,
    published_at: Option<String>,
    reference: Option<String>,
    source_url: Option<String>,
}

/// One batched lookup for the surviving id set, never one query per hit.
async fn fetch_display_rows(
    pool: &SqlitePool,
    corpus: &str,
    ids: impl Iterator<Item = i64>,
) -> Result<HashMap<i64, DisplayRow>> {
    let ids: Vec<i64> = ids.collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let table = db::docs_table(corpus);
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT id, title, published_at, reference, source_url FROM {table} WHERE id IN ({placeholders})",
    );
    let mut query = sqlx::query(&sql);
    for id in &ids {
        query = query.bind(id);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get::<i64, _>("id"),
                DisplayRow {
                    title: row.get("title"),
                    published_at: row.get("published_at"),
                    reference: row.get("reference"),
                    source_url: row.get("source_url"),
                },
            )
        })
        .collect())
}

/// Parse a `--vector` argument: comma-separated floats.
pub fn parse_vector_arg(raw: &str) -> Result<Vec<f32>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|_| anyhow::anyhow!("Invalid vector component: '{}'", part.trim()))
        })
        .collect()
}

/// Run the search command: resolve a query vector, warm or reuse the cache,
/// rank, enrich, print.
pub async fn run_search(
    config: &Config,
    corpus: &str,
    query: Option<String>,
    vector: Option<String>,
    limit: Option<i64>,
    threshold: Option<f32>,
) -> Result<()> {
    let corpus = config.corpus(corpus)?;

    // Resolve the query vector: an explicit --vector bypasses the provider.
    let query_vec = match (vector, query) {
        (Some(raw), _) => Some(parse_vector_arg(&raw)?),
        (None, Some(text)) if !text.trim().is_empty() => {
            if !config.embedding.is_enabled() {
                anyhow::bail!(
                    "Text queries require an embedding provider. Set [embedding] provider in config, or pass --vector."
                );
            }
            Some(embedding::embed_query(&config.embedding, &text).await?)
        }
        _ => None,
    };

    // Empty or non-extractable query: not an error.
    let query_vec = match query_vec.and_then(|v| embedding::normalize_l2(&v)) {
        Some(v) => v,
        None => {
            println!("No results.");
            return Ok(());
        }
    };

    let pool = db::connect(config).await?;
    let store = blobstore::create_store(&config.storage, &config.cache)?;
    let entries = cache::build_cache(&config.cache, &pool, store, &corpus).await?;

    let limit = limit.unwrap_or(config.search.default_limit);
    let threshold = threshold.unwrap_or(config.search.score_threshold);

    let response = search_corpus(&pool, &corpus, &entries, &query_vec, limit, threshold).await?;

    if response.results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, hit) in response.results.iter().enumerate() {
        let title = hit.title.as_deref().unwrap_or("(untitled)");
        println!("{}. [{:.3}] {}", i + 1, hit.score, title);
        if let Some(ref date) = hit.published_at {
            println!("    published: {}", date);
        }
        if let Some(ref reference) = hit.reference {
            println!("    reference: {}", reference);
        }
        if let Some(ref url) = hit.source_url {
            println!("    url: {}", url);
        }
        println!("    id: {}", hit.id);
        println!();
    }
    println!("count: {}", response.count);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize_l2;

    fn entry(id: i64, vector: Vec<f32>) -> CacheEntry {
        CacheEntry {
            id,
            title: Some(format!("Doc {}", id)),
            published_at: None,
            reference: None,
            source_url: None,
            vector,
        }
    }

    fn unit(v: &[f32]) -> Vec<f32> {
        normalize_l2(v).unwrap()
    }

    #[test]
    fn test_rank_empty_cache() {
        assert!(rank(&[1.0, 0.0], &[], 0.0, 10).is_empty());
    }

    #[test]
    fn test_rank_zero_norm_query() {
        let entries = vec![entry(1, unit(&[1.0, 0.0]))];
        assert!(rank(&[0.0, 0.0], &entries, 0.0, 10).is_empty());
        assert!(rank(&[], &entries, 0.0, 10).is_empty());
    }

    #[test]
    fn test_rank_threshold_and_order() {
        // Query [1,0] against X=[1,0], Y=[0,1], Z=[0.6,0.8], threshold 0.5:
        // X scores 1.0, Z scores 0.6, Y (0.0) is excluded.
        let entries = vec![
            entry(1, unit(&[1.0, 0.0])), // X
            entry(2, unit(&[0.0, 1.0])), // Y
            entry(3, unit(&[0.6, 0.8])), // Z
        ];
        let ranked = rank(&[1.0, 0.0], &entries, 0.5, 10);
        let ids: Vec<i64> = ranked.iter().map(|(e, _)| e.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!((ranked[0].1 - 1.0).abs() < 1e-6);
        assert!((ranked[1].1 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_rank_is_monotonic() {
        let entries = vec![
            entry(1, unit(&[0.2, 0.98])),
            entry(2, unit(&[1.0, 0.0])),
            entry(3, unit(&[0.7, 0.7])),
        ];
        let ranked = rank(&[1.0, 0.0], &entries, f32::MIN, 0);
        let scores: Vec<f32> = ranked.iter().map(|(_, s)| *s).collect();
        assert_eq!(ranked.len(), 3);
        assert!(scores[0] >= scores[1] && scores[1] >= scores[2]);
        assert!(scores.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_rank_ties_keep_cache_order() {
        let entries = vec![
            entry(10, unit(&[1.0, 0.0])),
            entry(20, unit(&[1.0, 0.0])),
            entry(30, unit(&[1.0, 0.0])),
        ];
        let ranked = rank(&[1.0, 0.0], &entries, 0.0, 0);
        let ids: Vec<i64> = ranked.iter().map(|(e, _)| e.id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_rank_limit_and_no_limit() {
        let entries: Vec<CacheEntry> = (0..8).map(|i| entry(i, unit(&[1.0, 0.0]))).collect();
        assert_eq!(rank(&[1.0, 0.0], &entries, 0.0, 3).len(), 3);
        assert_eq!(rank(&[1.0, 0.0], &entries, 0.0, 0).len(), 8);
        assert_eq!(rank(&[1.0, 0.0], &entries, 0.0, -1).len(), 8);
    }

    #[tokio::test]
    async fn test_search_corpus_enriches_from_store() {
        use crate::config::{CacheConfig, Config, DbConfig, StorageConfig};

        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            db: DbConfig {
                path: tmp.path().join("lexh.sqlite"),
            },
            corpora: vec!["gazette".to_string()],
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            search: Default::default(),
            embedding: Default::default(),
            server: Default::default(),
        };
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();

        // The stored row carries a corrected title the cache predates.
        sqlx::query("INSERT INTO docs_gazette (id, source_url, title) VALUES (?, ?, ?)")
            .bind(1i64)
            .bind("https://gazette.example/1")
            .bind("Corrected title")
            .execute(&pool)
            .await
            .unwrap();

        let entries = vec![
            entry(1, unit(&[1.0, 0.0])),  // in the store
            entry(99, unit(&[0.6, 0.8])), // cache-only, row deleted since
        ];

        let response = search_corpus(&pool, "gazette", &entries, &[1.0, 0.0], 10, 0.0)
            .await
            .unwrap();

        assert_eq!(response.count, 2);
        assert_eq!(response.results[0].id, 1);
        assert_eq!(response.results[0].title.as_deref(), Some("Corrected title"));
        // Entries without a backing row keep the cached display fields.
        assert_eq!(response.results[1].id, 99);
        assert_eq!(response.results[1].title.as_deref(), Some("Doc 99"));

        pool.close().await;
    }

    #[test]
    fn test_parse_vector_arg() {
        assert_eq!(
            parse_vector_arg("0.6, 0.8").unwrap(),
            vec![0.6f32, 0.8f32]
        );
        assert_eq!(parse_vector_arg("-1").unwrap(), vec![-1.0f32]);
        assert!(parse_vector_arg("0.6, x").is_err());
        assert!(parse_vector_arg("").is_err());
    }
}
