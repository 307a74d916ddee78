//! Core data types shared across the pipeline core.
//!
//! These mirror the per-corpus `docs_<corpus>` table and the reports the
//! reconciler and search commands produce.

use serde::{Deserialize, Serialize};

use crate::status::PhaseStatus;

/// One row of a corpus documents table, as read by the reconciler.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: i64,
    pub source_url: String,
    pub title: Option<String>,
    pub published_at: Option<String>,
    pub reference: Option<String>,
    pub download_status: PhaseStatus,
    pub extract_status: PhaseStatus,
    pub embedding_status: PhaseStatus,
    pub downloaded_at: Option<i64>,
    pub extracted_at: Option<i64>,
    pub embedded_at: Option<i64>,
    pub raw_key: Option<String>,
    pub text_key: Option<String>,
    pub embedding_key: Option<String>,
    pub analysis_json: Option<String>,
    pub error_log: Option<String>,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Documents examined.
    pub processed: u64,
    /// Documents with at least one phase whose status disagrees with
    /// ground truth.
    pub correctable: u64,
    /// Documents actually written back (always 0 in report mode).
    pub applied: u64,
}

/// One ranked search hit, enriched with display fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub score: f32,
    pub title: Option<String>,
    pub published_at: Option<String>,
    pub reference: Option<String>,
    pub source_url: Option<String>,
}

/// Search response envelope returned by the CLI and HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub count: usize,
}

impl SearchResponse {
    /// The canonical "nothing matched / nothing extractable" response.
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            count: 0,
        }
    }
}
