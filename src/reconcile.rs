//! Status reconciler: compare declared phase statuses against ground truth
//! and repair drift.
//!
//! Ground truth per phase:
//! - **download** — the raw blob behind `raw_key` exists in the blob store
//! - **text_extraction** — the text blob behind `text_key` exists
//! - **embedding** — `analysis_json` carries a non-empty `embedding.vector`
//!
//! Blob existence checks go through a pass-scoped [`ExistenceCache`], so a
//! key shared by several rows is probed once. A failed check (network
//! error) counts as "absent" for that check only and never aborts the pass.
//!
//! Report mode performs no writes. Apply mode writes every correction of a
//! pass inside a single transaction: a crash mid-pass leaves either the old
//! state or the fully corrected one.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::blobstore::{self, BlobStore, ExistenceCache};
use crate::config::Config;
use crate::db;
use crate::models::{DocumentRow, ReconcileReport};
use crate::status::{reconcile, Phase, PhaseStatus};

/// The phases whose ground truth the reconciler can observe.
const RECONCILED_PHASES: [Phase; 3] = [Phase::Download, Phase::TextExtraction, Phase::Embedding];

struct Correction {
    phase: Phase,
    from: PhaseStatus,
    to: PhaseStatus,
}

/// Does the analysis document carry a usable embedding vector?
fn embedding_vector_present(analysis_json: Option<&str>) -> bool {
    let Some(raw) = analysis_json else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return false;
    };
    value
        .get("embedding")
        .and_then(|e| e.get("vector"))
        .and_then(|v| v.as_array())
        .is_some_and(|a| !a.is_empty())
}

fn declared_status(row: &DocumentRow, phase: Phase) -> PhaseStatus {
    match phase {
        Phase::Download => row.download_status,
        Phase::TextExtraction => row.extract_status,
        Phase::Embedding => row.embedding_status,
        Phase::MetadataCollection | Phase::AiAnalysis => PhaseStatus::Pending,
    }
}

fn declared_timestamp(row: &DocumentRow, phase: Phase) -> Option<i64> {
    match phase {
        Phase::Download => row.downloaded_at,
        Phase::TextExtraction => row.extracted_at,
        Phase::Embedding => row.embedded_at,
        Phase::MetadataCollection | Phase::AiAnalysis => None,
    }
}

async fn ground_truth(
    row: &DocumentRow,
    phase: Phase,
    store: &dyn BlobStore,
    existence: &mut ExistenceCache,
) -> bool {
    match phase {
        Phase::Download => match &row.raw_key {
            Some(key) => existence.check(store, key).await,
            None => false,
        },
        Phase::TextExtraction => match &row.text_key {
            Some(key) => existence.check(store, key).await,
            None => false,
        },
        Phase::Embedding => embedding_vector_present(row.analysis_json.as_deref()),
        Phase::MetadataCollection | Phase::AiAnalysis => false,
    }
}

async fn load_rows(pool: &SqlitePool, corpus: &str, limit: i64) -> Result<Vec<DocumentRow>> {
    let table = db::docs_table(corpus);

    // SQLite treats LIMIT -1 as unlimited.
    let rows = sqlx::query(&format!(
        "SELECT id, source_url, title, published_at, reference, \
                download_status, extract_status, embedding_status, \
                downloaded_at, extracted_at, embedded_at, \
                raw_key, text_key, embedding_key, analysis_json, error_log \
         FROM {table} ORDER BY id LIMIT ?",
    ))
    .bind(if limit > 0 { limit } else { -1 })
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| DocumentRow {
            id: row.get("id"),
            source_url: row.get("source_url"),
            title: row.get("title"),
            published_at: row.get("published_at"),
            reference: row.get("reference"),
            download_status: PhaseStatus::normalize(&row.get::<String, _>("download_status")),
            extract_status: PhaseStatus::normalize(&row.get::<String, _>("extract_status")),
            embedding_status: PhaseStatus::normalize(&row.get::<String, _>("embedding_status")),
            downloaded_at: row.get("downloaded_at"),
            extracted_at: row.get("extracted_at"),
            embedded_at: row.get("embedded_at"),
            raw_key: row.get("raw_key"),
            text_key: row.get("text_key"),
            embedding_key: row.get("embedding_key"),
            analysis_json: row.get("analysis_json"),
            error_log: row.get("error_log"),
        })
        .collect())
}

/// Run one reconciliation pass over a corpus.
pub async fn reconcile_corpus(
    pool: &SqlitePool,
    store: Arc<dyn BlobStore>,
    corpus: &str,
    limit: i64,
    apply: bool,
    verbose: bool,
) -> Result<ReconcileReport> {
    let table = db::docs_table(corpus);
    let rows = load_rows(pool, corpus, limit).await?;

    let mut existence = ExistenceCache::new();
    let mut report = ReconcileReport::default();
    let mut tx = if apply { Some(pool.begin().await?) } else { None };
    let now = Utc::now().timestamp();

    for row in rows {
        report.processed += 1;

        let mut corrections: Vec<Correction> = Vec::new();
        let mut in_flight = false;

        for phase in RECONCILED_PHASES {
            let declared = declared_status(&row, phase);
            if declared == PhaseStatus::InProgress {
                // A live worker owns this phase; leave it alone.
                in_flight = true;
                continue;
            }

            let exists = ground_truth(&row, phase, store.as_ref(), &mut existence).await;
            let corrected = reconcile(declared, exists);
            if corrected != declared {
                corrections.push(Correction {
                    phase,
                    from: declared,
                    to: corrected,
                });
            }
        }

        if !corrections.is_empty() {
            report.correctable += 1;
            if verbose {
                for c in &corrections {
                    println!(
                        "  doc {:>6}  {:<16} {} -> {}",
                        row.id,
                        c.phase.name(),
                        c.from.as_str(),
                        c.to.as_str()
                    );
                }
            }
        }

        let Some(tx) = tx.as_mut() else {
            continue;
        };

        let mut wrote = false;
        for c in &corrections {
            let status_col = c.phase.status_column();
            let ts_col = c.phase.timestamp_column();
            match c.to {
                PhaseStatus::Success => {
                    // Stamp only when the phase never recorded a completion.
                    let stamp = declared_timestamp(&row, c.phase).unwrap_or(now);
                    sqlx::query(&format!(
                        "UPDATE {table} SET {status_col} = ?, {ts_col} = ? WHERE id = ?",
                    ))
                    .bind(c.to.as_str())
                    .bind(stamp)
                    .bind(row.id)
                    .execute(&mut **tx)
                    .await?;
                }
                _ => {
                    sqlx::query(&format!(
                        "UPDATE {table} SET {status_col} = ?, {ts_col} = NULL WHERE id = ?",
                    ))
                    .bind(c.to.as_str())
                    .bind(row.id)
                    .execute(&mut **tx)
                    .await?;
                }
            }
            wrote = true;
        }

        // A document leaving the pass fully consistent has nothing left to
        // report; stale failure messages would only mislead.
        if row.error_log.is_some() && !in_flight {
            sqlx::query(&format!("UPDATE {table} SET error_log = NULL WHERE id = ?"))
                .bind(row.id)
                .execute(&mut **tx)
                .await?;
            wrote = true;
        }

        if wrote {
            report.applied += 1;
        }
    }

    if let Some(tx) = tx {
        tx.commit().await?;
    }

    tracing::info!(
        corpus,
        processed = report.processed,
        correctable = report.correctable,
        applied = report.applied,
        apply,
        "reconcile pass finished"
    );

    Ok(report)
}

/// Run the reconcile command and print the pass summary.
pub async fn run_reconcile(
    config: &Config,
    corpus: &str,
    limit: i64,
    apply: bool,
    verbose: bool,
) -> Result<()> {
    let corpus = config.corpus(corpus)?;
    let pool = db::connect(config).await?;
    let store = blobstore::create_store(&config.storage, &config.cache)?;

    let report = reconcile_corpus(&pool, store, &corpus, limit, apply, verbose).await?;

    println!("Corpus '{}':", corpus);
    println!("  processed:   {}", report.processed);
    println!("  correctable: {}", report.correctable);
    println!("  applied:     {}", report.applied);
    if !apply && report.correctable > 0 {
        println!("  (report mode; rerun with --apply to write corrections)");
    }

    pool.close().await;
    Ok(())
}
