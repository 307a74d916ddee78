use anyhow::Result;

use crate::config::Config;
use crate::db;

/// Create one documents table per configured corpus. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    for corpus in &config.corpora {
        let table = db::docs_table(corpus);

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                source_url TEXT NOT NULL UNIQUE,
                title TEXT,
                published_at TEXT,
                reference TEXT,
                metadata_status TEXT NOT NULL DEFAULT 'pending',
                download_status TEXT NOT NULL DEFAULT 'pending',
                extract_status TEXT NOT NULL DEFAULT 'pending',
                analysis_status TEXT NOT NULL DEFAULT 'pending',
                embedding_status TEXT NOT NULL DEFAULT 'pending',
                collected_at INTEGER,
                downloaded_at INTEGER,
                extracted_at INTEGER,
                analyzed_at INTEGER,
                embedded_at INTEGER,
                raw_key TEXT,
                text_key TEXT,
                embedding_key TEXT,
                analysis_json TEXT,
                error_log TEXT
            )
            "#,
        ))
        .execute(&pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_embedding_key ON {table}(embedding_key)",
        ))
        .execute(&pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_download_status ON {table}(download_status)",
        ))
        .execute(&pool)
        .await?;
    }

    pool.close().await;
    Ok(())
}
