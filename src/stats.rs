//! Pipeline status overview.
//!
//! Provides a quick summary of harvest progress: per-corpus document counts
//! and a per-phase status breakdown. Used by `lexh stats` to give confidence
//! that harvests, reconciliation, and embedding are working as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::status::{Phase, PhaseStatus};

/// Status counts of one phase within one corpus.
struct PhaseRow {
    phase: Phase,
    pending: i64,
    in_progress: i64,
    success: i64,
    failed: i64,
}

/// Run the stats command: query each corpus table and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Lexharvest — Pipeline Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));

    for corpus in &config.corpora {
        let table = db::docs_table(corpus);

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&pool)
            .await?;
        let with_errors: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE error_log IS NOT NULL",
        ))
        .fetch_one(&pool)
        .await?;

        let mut phases: Vec<PhaseRow> = Vec::new();
        for phase in Phase::ALL {
            let col = phase.status_column();
            let rows = sqlx::query(&format!(
                "SELECT {col} AS status, COUNT(*) AS n FROM {table} GROUP BY {col}",
            ))
            .fetch_all(&pool)
            .await?;

            let mut counts = PhaseRow {
                phase,
                pending: 0,
                in_progress: 0,
                success: 0,
                failed: 0,
            };
            for row in &rows {
                let status: String = row.get("status");
                let n: i64 = row.get("n");
                // Legacy values land in the pending bucket, same as on read.
                match PhaseStatus::normalize(&status) {
                    PhaseStatus::Pending => counts.pending += n,
                    PhaseStatus::InProgress => counts.in_progress += n,
                    PhaseStatus::Success => counts.success += n,
                    PhaseStatus::Failed => counts.failed += n,
                }
            }
            phases.push(counts);
        }

        println!();
        println!("  Corpus '{}': {} documents, {} with errors", corpus, total, with_errors);
        println!(
            "  {:<20} {:>8} {:>12} {:>8} {:>8}",
            "PHASE", "PENDING", "IN_PROGRESS", "SUCCESS", "FAILED"
        );
        println!("  {}", "-".repeat(60));
        for p in &phases {
            println!(
                "  {:<20} {:>8} {:>12} {:>8} {:>8}",
                p.phase.name(),
                p.pending,
                p.in_progress,
                p.success,
                p.failed
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
