//! fociquant-export: Pure table serializers (sans-IO)
//!
//! Converts pipeline results into output documents: CSV tables for
//! objects, nuclei, and channel totals, plus a JSON run report.
//! Nothing here touches the filesystem.

pub mod csv;
pub mod report;

pub use csv::{
    channel_summary_csv, escape_field, nuclei_summary_csv, objects_csv, objects_file_name,
};
pub use report::{ReportMetadata, run_report_json};

/// Errors produced while rendering a document.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The embedded configuration string is not valid JSON.
    #[error("invalid config JSON: {0}")]
    InvalidConfigJson(#[source] serde_json::Error),

    /// The report could not be serialized.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
