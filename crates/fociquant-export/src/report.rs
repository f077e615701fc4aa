//! Run report serializer.
//!
//! Renders a [`RunSummary`] as a single JSON document: run metadata,
//! per-image outcome, nucleus counts, warnings, and stage diagnostics.
//! Per-object data stays in the CSV tables.
//!
//! This is a pure function with no I/O -- it returns a `String`.

use fociquant_pipeline::{ImageRecord, ImageSummary, PipelineDiagnostics, RunSummary};
use serde::Serialize;

use crate::ExportError;

/// Metadata embedded at the top of the report.
///
/// All fields are optional. Absent fields are omitted from the JSON.
#[derive(Debug, Clone, Default)]
pub struct ReportMetadata<'a> {
    /// Manifest path the run was started from.
    pub manifest: Option<&'a str>,

    /// Export timestamp.
    pub timestamp: Option<&'a str>,

    /// Full `PipelineConfig` JSON, embedded as an object so the run can
    /// be reproduced.
    pub config_json: Option<&'a str>,
}

#[derive(Serialize)]
struct RunReport<'a> {
    tool: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<serde_json::Value>,
    succeeded: usize,
    skipped: usize,
    cancelled: usize,
    outcomes: &'a [ImageRecord],
    images: Vec<ImageReport<'a>>,
}

#[derive(Serialize)]
struct ImageReport<'a> {
    image_id: &'a str,
    unit: &'a str,
    pixel_width: f64,
    pixel_height: f64,
    nucleus_count: usize,
    channel_sets: &'a [String],
    warnings: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<&'a PipelineDiagnostics>,
}

impl<'a> From<&'a ImageSummary> for ImageReport<'a> {
    fn from(image: &'a ImageSummary) -> Self {
        Self {
            image_id: &image.image_id,
            unit: &image.calibration.unit,
            pixel_width: image.calibration.pixel_width,
            pixel_height: image.calibration.pixel_height,
            nucleus_count: image.nuclei.len(),
            channel_sets: &image.channel_sets,
            warnings: &image.warnings,
            diagnostics: image.diagnostics.as_ref(),
        }
    }
}

/// Serialize a batch run into pretty-printed JSON.
///
/// # Errors
///
/// Returns [`ExportError::InvalidConfigJson`] if `metadata.config_json`
/// is not valid JSON, or [`ExportError::Json`] if serialization fails.
pub fn run_report_json(
    summary: &RunSummary,
    metadata: &ReportMetadata<'_>,
) -> Result<String, ExportError> {
    let config = metadata
        .config_json
        .map(serde_json::from_str)
        .transpose()
        .map_err(ExportError::InvalidConfigJson)?;

    let report = RunReport {
        tool: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        manifest: metadata.manifest,
        timestamp: metadata.timestamp,
        config,
        succeeded: summary.succeeded().len(),
        skipped: summary.skipped().len(),
        cancelled: summary.cancelled().len(),
        outcomes: &summary.outcomes,
        images: summary.images.iter().map(ImageReport::from).collect(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use fociquant_pipeline::{Calibration, Dimensions, ImageOutcome, PipelineError};

    use super::*;

    fn summary() -> RunSummary {
        RunSummary {
            images: vec![ImageSummary {
                image_id: "img_1".to_owned(),
                calibration: Calibration::default(),
                dimensions: Dimensions::new(8, 8),
                channel_sets: vec!["Foci_1".to_owned()],
                nuclei: Vec::new(),
                channels: Vec::new(),
                warnings: vec!["colocalization skipped".to_owned()],
                diagnostics: None,
            }],
            outcomes: vec![
                ImageRecord {
                    image_id: "img_1".to_owned(),
                    outcome: ImageOutcome::Succeeded,
                },
                ImageRecord {
                    image_id: "img_2".to_owned(),
                    outcome: ImageOutcome::Skipped {
                        reason: PipelineError::MissingInput("img_2/foci_1.tif".to_owned()),
                    },
                },
            ],
        }
    }

    #[test]
    fn counts_outcomes() {
        let json = run_report_json(&summary(), &ReportMetadata::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["succeeded"], 1);
        assert_eq!(value["skipped"], 1);
        assert_eq!(value["cancelled"], 0);
        assert_eq!(value["outcomes"][1]["status"], "skipped");
        assert_eq!(
            value["outcomes"][1]["reason"]["MissingInput"],
            "img_2/foci_1.tif"
        );
        assert_eq!(value["images"][0]["warnings"][0], "colocalization skipped");
        assert_eq!(value["images"][0]["unit"], "micron");
    }

    #[test]
    fn absent_metadata_is_omitted() {
        let json = run_report_json(&summary(), &ReportMetadata::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.get("config").is_none());
        assert!(value.get("timestamp").is_none());
        assert!(value["images"][0].get("diagnostics").is_none());
    }

    #[test]
    fn config_is_embedded_as_object() {
        let metadata = ReportMetadata {
            config_json: Some(r#"{"min_nucleus_size_px":2500}"#),
            manifest: Some("manifest.json"),
            ..ReportMetadata::default()
        };
        let json = run_report_json(&summary(), &metadata).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["config"]["min_nucleus_size_px"], 2500);
        assert_eq!(value["manifest"], "manifest.json");
    }

    #[test]
    fn invalid_config_json_is_rejected() {
        let metadata = ReportMetadata {
            config_json: Some("{not json"),
            ..ReportMetadata::default()
        };
        assert!(matches!(
            run_report_json(&summary(), &metadata),
            Err(ExportError::InvalidConfigJson(_))
        ));
    }
}
