//! Lexharvest — status tracking and semantic search for harvested legal
//! documents.
//!
//! The library models a multi-phase document pipeline (metadata collection,
//! download, text extraction, AI analysis, embedding) over per-corpus SQLite
//! tables, keeps the declared phase statuses honest against the blob store
//! with a batch reconciler, and serves cosine-similarity search from an
//! in-memory embedding cache with a JSON snapshot fast path.
//!
//! Modules:
//!
//! - [`status`] — phase vocabulary and the pure reconcile transition
//! - [`reconcile`] — the batch reconciler command
//! - [`blobstore`] — S3 (SigV4) and filesystem artifact stores
//! - [`cache`] / [`warmup`] — embedding cache build and warm-up lifecycle
//! - [`search`] / [`server`] — the ranker, CLI command, and HTTP API

pub mod blobstore;
pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod migrate;
pub mod models;
pub mod reconcile;
pub mod search;
pub mod server;
pub mod stats;
pub mod status;
pub mod warmup;
