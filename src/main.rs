//! # Lexharvest CLI (`lexh`)
//!
//! The `lexh` binary is the operator interface for the harvest pipeline.
//! It provides commands for database initialization, status reconciliation,
//! semantic search, embedding-cache management, and the HTTP search server.
//!
//! ## Usage
//!
//! ```bash
//! lexh --config ./config/lexh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lexh init` | Create the SQLite database and per-corpus tables |
//! | `lexh reconcile <corpus>` | Compare declared statuses against stored artifacts |
//! | `lexh search <corpus> "<query>"` | Rank documents by cosine similarity |
//! | `lexh cache warm <corpus>` | Rebuild the embedding cache from the blob store |
//! | `lexh cache invalidate <corpus>` | Drop a corpus snapshot |
//! | `lexh cache status` | Show snapshot presence and entry counts |
//! | `lexh stats` | Per-corpus, per-phase status overview |
//! | `lexh serve` | Start the HTTP search server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! lexh init --config ./config/lexh.toml
//!
//! # Dry-run reconciliation of the gazette corpus
//! lexh reconcile gazette --verbose
//!
//! # Write the corrections
//! lexh reconcile gazette --apply
//!
//! # Semantic search with a server-side embedded query
//! lexh search gazette "expropriation compensation"
//!
//! # Search with a pre-computed vector (no provider needed)
//! lexh search gazette --vector "0.12,-0.8,0.33"
//!
//! # Start the HTTP API
//! lexh serve --config ./config/lexh.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lexharvest::{cache, config, migrate, reconcile, search, server, stats};

/// Lexharvest CLI — pipeline status tracking and semantic search for
/// harvested legal documents.
#[derive(Parser)]
#[command(
    name = "lexh",
    about = "Lexharvest — pipeline status tracking and semantic search for harvested legal documents",
    version,
    long_about = "Lexharvest tracks harvested legal documents (gazettes, rulings) through a \
    five-phase pipeline, reconciles declared phase statuses against the artifacts actually \
    present in blob storage, and serves cosine-similarity search over an in-memory embedding \
    cache via a CLI and HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lexh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and one documents table per
    /// configured corpus. Idempotent.
    Init,

    /// Reconcile declared phase statuses against ground truth.
    ///
    /// For every document: does the raw blob exist, does the text blob
    /// exist, does the analysis carry an embedding vector. Without
    /// `--apply` this is a dry run that only reports discrepancies.
    Reconcile {
        /// Corpus to reconcile (e.g. `gazette`).
        corpus: String,

        /// Maximum number of documents to examine (0 = all).
        #[arg(long, default_value_t = 0)]
        limit: i64,

        /// Write corrections back (one transaction for the whole pass).
        #[arg(long)]
        apply: bool,

        /// Print each discrepancy as it is found.
        #[arg(long)]
        verbose: bool,
    },

    /// Search a corpus by semantic similarity.
    Search {
        /// Corpus to search (e.g. `gazette`).
        corpus: String,

        /// The query text, embedded with the configured provider.
        query: Option<String>,

        /// A pre-computed query vector as comma-separated floats;
        /// bypasses the embedding provider.
        #[arg(long)]
        vector: Option<String>,

        /// Maximum number of results (0 or less = unlimited).
        #[arg(long)]
        limit: Option<i64>,

        /// Minimum similarity score; results strictly below are dropped.
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Manage the embedding cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show per-corpus, per-phase pipeline statistics.
    Stats,

    /// Start the HTTP search server.
    Serve,
}

/// Embedding-cache subcommands.
#[derive(Subcommand)]
enum CacheCommands {
    /// Rebuild a corpus cache from the blob store and persist the snapshot.
    Warm { corpus: String },

    /// Drop the on-disk snapshot for a corpus.
    Invalidate { corpus: String },

    /// Show snapshot presence and entry counts for all corpora.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("Database initialized at {}", config.db.path.display());
            println!("Corpora: {}", config.corpora.join(", "));
            Ok(())
        }
        Commands::Reconcile {
            corpus,
            limit,
            apply,
            verbose,
        } => reconcile::run_reconcile(&config, &corpus, limit, apply, verbose).await,
        Commands::Search {
            corpus,
            query,
            vector,
            limit,
            threshold,
        } => search::run_search(&config, &corpus, query, vector, limit, threshold).await,
        Commands::Cache { command } => match command {
            CacheCommands::Warm { corpus } => cache::run_cache_warm(&config, &corpus).await,
            CacheCommands::Invalidate { corpus } => {
                cache::run_cache_invalidate(&config, &corpus).await
            }
            CacheCommands::Status => cache::run_cache_status(&config).await,
        },
        Commands::Stats => stats::run_stats(&config).await,
        Commands::Serve => server::run_server(&config).await,
    }
}
