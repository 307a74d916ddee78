//! Pipeline phase vocabulary and status transition rules.
//!
//! Every harvested document carries one status value per pipeline phase.
//! Statuses are persisted as strings in SQLite, so the on-disk vocabulary
//! must stay stable across versions: `pending`, `in_progress`, `success`,
//! `failed`. Anything else (including the deprecated `skipped`) normalizes
//! to `pending` on read.
//!
//! [`reconcile`] is the single pure function that decides how a declared
//! status changes when compared against ground truth (does the artifact
//! actually exist in the blob store / metadata store). It is deliberately
//! conservative: it never turns `success` into `pending` and never
//! fabricates an `in_progress`.

use std::fmt;

/// One stage of the document pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    MetadataCollection,
    Download,
    TextExtraction,
    AiAnalysis,
    Embedding,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ALL: [Phase; 5] = [
        Phase::MetadataCollection,
        Phase::Download,
        Phase::TextExtraction,
        Phase::AiAnalysis,
        Phase::Embedding,
    ];

    /// The status column for this phase in a corpus documents table.
    pub fn status_column(&self) -> &'static str {
        match self {
            Phase::MetadataCollection => "metadata_status",
            Phase::Download => "download_status",
            Phase::TextExtraction => "extract_status",
            Phase::AiAnalysis => "analysis_status",
            Phase::Embedding => "embedding_status",
        }
    }

    /// The timestamp column stamped when this phase reaches `success`.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            Phase::MetadataCollection => "collected_at",
            Phase::Download => "downloaded_at",
            Phase::TextExtraction => "extracted_at",
            Phase::AiAnalysis => "analyzed_at",
            Phase::Embedding => "embedded_at",
        }
    }

    /// Stable identifier used in CLI output and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::MetadataCollection => "metadata_collection",
            Phase::Download => "download",
            Phase::TextExtraction => "text_extraction",
            Phase::AiAnalysis => "ai_analysis",
            Phase::Embedding => "embedding",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed status vocabulary for a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl PhaseStatus {
    /// Map any stored string to a canonical status.
    ///
    /// Total over all inputs: unknown, empty, and legacy values (the old
    /// `skipped` marker among them) come back as `Pending`.
    pub fn normalize(raw: &str) -> PhaseStatus {
        match raw.trim() {
            "in_progress" => PhaseStatus::InProgress,
            "success" => PhaseStatus::Success,
            "failed" => PhaseStatus::Failed,
            _ => PhaseStatus::Pending,
        }
    }

    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Success => "success",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide the corrected status for a phase given ground truth.
///
/// - artifact exists and the phase claims `pending` or `failed` → `success`
/// - artifact missing and the phase claims `success` → `failed`
/// - otherwise the declared status stands
///
/// `in_progress` is left alone in both directions: an in-flight worker may
/// legitimately not have produced its artifact yet, and if it already has,
/// the worker itself will flip the status when it finishes.
pub fn reconcile(declared: PhaseStatus, ground_truth_exists: bool) -> PhaseStatus {
    match (declared, ground_truth_exists) {
        (PhaseStatus::Pending | PhaseStatus::Failed, true) => PhaseStatus::Success,
        (PhaseStatus::Success, false) => PhaseStatus::Failed,
        (other, _) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_canonical_values() {
        assert_eq!(PhaseStatus::normalize("pending"), PhaseStatus::Pending);
        assert_eq!(
            PhaseStatus::normalize("in_progress"),
            PhaseStatus::InProgress
        );
        assert_eq!(PhaseStatus::normalize("success"), PhaseStatus::Success);
        assert_eq!(PhaseStatus::normalize("failed"), PhaseStatus::Failed);
    }

    #[test]
    fn test_normalize_is_total() {
        // Unknown, legacy, empty, and junk inputs all land on Pending.
        for raw in ["", "skipped", "SUCCESS", "done", "null", "  ", "0", "🦀"] {
            assert_eq!(
                PhaseStatus::normalize(raw),
                PhaseStatus::Pending,
                "input {:?} should normalize to pending",
                raw
            );
        }
    }

    #[test]
    fn test_normalize_trims_whitespace() {
        assert_eq!(PhaseStatus::normalize(" success "), PhaseStatus::Success);
        assert_eq!(PhaseStatus::normalize("failed\n"), PhaseStatus::Failed);
    }

    #[test]
    fn test_roundtrip_as_str() {
        for status in [
            PhaseStatus::Pending,
            PhaseStatus::InProgress,
            PhaseStatus::Success,
            PhaseStatus::Failed,
        ] {
            assert_eq!(PhaseStatus::normalize(status.as_str()), status);
        }
    }

    #[test]
    fn test_reconcile_upgrades_when_artifact_exists() {
        assert_eq!(reconcile(PhaseStatus::Pending, true), PhaseStatus::Success);
        assert_eq!(reconcile(PhaseStatus::Failed, true), PhaseStatus::Success);
    }

    #[test]
    fn test_reconcile_downgrades_missing_success() {
        assert_eq!(reconcile(PhaseStatus::Success, false), PhaseStatus::Failed);
    }

    #[test]
    fn test_reconcile_leaves_consistent_states_alone() {
        assert_eq!(reconcile(PhaseStatus::Success, true), PhaseStatus::Success);
        assert_eq!(reconcile(PhaseStatus::Pending, false), PhaseStatus::Pending);
        assert_eq!(reconcile(PhaseStatus::Failed, false), PhaseStatus::Failed);
    }

    #[test]
    fn test_reconcile_never_touches_in_progress() {
        assert_eq!(
            reconcile(PhaseStatus::InProgress, true),
            PhaseStatus::InProgress
        );
        assert_eq!(
            reconcile(PhaseStatus::InProgress, false),
            PhaseStatus::InProgress
        );
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        for declared in [
            PhaseStatus::Pending,
            PhaseStatus::InProgress,
            PhaseStatus::Success,
            PhaseStatus::Failed,
        ] {
            for exists in [true, false] {
                let once = reconcile(declared, exists);
                let twice = reconcile(once, exists);
                assert_eq!(once, twice, "reconcile({}, {}) not idempotent", declared, exists);
            }
        }
    }

    #[test]
    fn test_phase_columns_are_distinct() {
        let mut status_cols: Vec<&str> = Phase::ALL.iter().map(|p| p.status_column()).collect();
        let mut ts_cols: Vec<&str> = Phase::ALL.iter().map(|p| p.timestamp_column()).collect();
        status_cols.sort();
        status_cols.dedup();
        ts_cols.sort();
        ts_cols.dedup();
        assert_eq!(status_cols.len(), Phase::ALL.len());
        assert_eq!(ts_cols.len(), Phase::ALL.len());
    }
}
