//! Batch orchestration: run the per-image pipeline over a manifest.
//!
//! The orchestrator never touches the filesystem. Each manifest entry is
//! turned into [`ImageInputs`] by a caller-supplied [`GroupLoader`], so
//! the same code drives the CLI (files on disk) and tests (in-memory
//! rasters).
//!
//! Images run concurrently on a dedicated `rayon` pool. A failing image
//! is recorded as skipped with its [`PipelineError`] and never aborts the
//! batch. Results are sorted by image id, so the output does not depend
//! on completion order.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::diagnostics::StdClock;
use crate::segment::Segmenter;
use crate::types::{ImageInputs, ImageSummary, PipelineConfig, PipelineError};

/// Ordered list of image groups making up one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Image groups, processed in any order and reported sorted by id.
    pub groups: Vec<ImageGroupSpec>,
}

impl Manifest {
    /// Check that every group has a non-empty, unique id.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] naming the first empty
    /// or repeated id.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.id.trim().is_empty() {
                return Err(PipelineError::InvalidParameter(
                    "manifest group id must not be empty".to_owned(),
                ));
            }
            if !seen.insert(group.id.as_str()) {
                return Err(PipelineError::InvalidParameter(format!(
                    "duplicate manifest group id '{}'",
                    group.id,
                )));
            }
        }
        Ok(())
    }
}

/// One image group: a nucleus source plus named foci channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGroupSpec {
    /// Stable identifier, unique within the manifest.
    pub id: String,
    /// Nucleus source (segmentation label image or raw nucleus channel).
    pub nucleus: PathBuf,
    /// Foci channel name to image path.
    pub foci: BTreeMap<String, PathBuf>,
    /// Inline calibration; takes precedence over `metadata`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
    /// Microscope metadata file to look the calibration up in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PathBuf>,
}

/// Turns a manifest entry into decoded, calibrated inputs.
pub trait GroupLoader: Sync {
    /// Load every raster of `group`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::MissingInput`] for absent files,
    /// [`PipelineError::CorruptMask`] or [`PipelineError::ImageDecode`]
    /// for unreadable data.
    fn load(&self, group: &ImageGroupSpec) -> Result<ImageInputs, PipelineError>;
}

/// Run-level settings that are not part of the per-image pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum concurrently processed images. 0 uses every core.
    pub workers: usize,
}

/// Shared flag that stops dispatch of further images.
///
/// Images already running finish normally; images not yet started are
/// reported as [`ImageOutcome::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Visible to every clone.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one image group.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    /// Processed; its summary is in [`RunSummary::images`].
    Succeeded,
    /// Failed to load or process.
    Skipped {
        /// Why the image was skipped.
        reason: PipelineError,
    },
    /// Never started because the run was cancelled.
    Cancelled,
}

/// Outcome of one image group.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Group id from the manifest.
    pub image_id: String,
    /// Outcome.
    pub outcome: ImageOutcome,
}

/// Everything a batch produced.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Summaries of succeeded images, sorted by image id.
    pub images: Vec<ImageSummary>,
    /// One record per manifest group, sorted by image id.
    pub outcomes: Vec<ImageRecord>,
}

impl RunSummary {
    /// Ids of images that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|r| matches!(r.outcome, ImageOutcome::Succeeded))
            .map(|r| r.image_id.as_str())
            .collect()
    }

    /// Ids of skipped images with their reasons.
    #[must_use]
    pub fn skipped(&self) -> Vec<(&str, &PipelineError)> {
        self.outcomes
            .iter()
            .filter_map(|r| match &r.outcome {
                ImageOutcome::Skipped { reason } => Some((r.image_id.as_str(), reason)),
                _ => None,
            })
            .collect()
    }

    /// Ids of images never started.
    #[must_use]
    pub fn cancelled(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|r| matches!(r.outcome, ImageOutcome::Cancelled))
            .map(|r| r.image_id.as_str())
            .collect()
    }

    /// A run succeeds if at least one image succeeded or there was
    /// nothing to do.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.is_empty() || !self.images.is_empty()
    }
}

/// Run the pipeline for every group of `manifest`, segmenting nuclei
/// with `config.segmenter`.
///
/// # Errors
///
/// See [`run_batch_with_segmenter`].
pub fn run_batch<L: GroupLoader>(
    manifest: &Manifest,
    loader: &L,
    config: &PipelineConfig,
    batch: &BatchConfig,
    cancel: &CancelToken,
) -> Result<RunSummary, PipelineError> {
    run_batch_with_segmenter(manifest, loader, config, &config.segmenter, batch, cancel)
}

/// Run the pipeline for every group of `manifest` with a caller-supplied
/// nucleus segmenter shared by all workers.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if `config` or the
/// manifest is invalid, or the worker pool cannot be created. Per-image
/// failures are reported in the [`RunSummary`] instead.
pub fn run_batch_with_segmenter<L, S>(
    manifest: &Manifest,
    loader: &L,
    config: &PipelineConfig,
    segmenter: &S,
    batch: &BatchConfig,
    cancel: &CancelToken,
) -> Result<RunSummary, PipelineError>
where
    L: GroupLoader,
    S: Segmenter + Sync + ?Sized,
{
    config.validate()?;
    manifest.validate()?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(batch.workers)
        .thread_name(|i| format!("fociquant-worker-{i}"))
        .build()
        .map_err(|e| PipelineError::InvalidParameter(format!("cannot start worker pool: {e}")))?;

    info!(
        "processing {} image groups on {} workers",
        manifest.groups.len(),
        pool.current_num_threads(),
    );

    let results: Vec<(ImageRecord, Option<ImageSummary>)> = pool.install(|| {
        manifest
            .groups
            .par_iter()
            .map(|group| run_group(group, loader, config, segmenter, cancel))
            .collect()
    });

    let mut summary = RunSummary::default();
    for (record, image) in results {
        summary.outcomes.push(record);
        summary.images.extend(image);
    }
    summary.outcomes.sort_by(|a, b| a.image_id.cmp(&b.image_id));
    summary.images.sort_by(|a, b| a.image_id.cmp(&b.image_id));

    info!(
        "run finished: {} succeeded, {} skipped, {} cancelled",
        summary.succeeded().len(),
        summary.skipped().len(),
        summary.cancelled().len(),
    );
    Ok(summary)
}

fn run_group<L: GroupLoader, S: Segmenter + Sync + ?Sized>(
    group: &ImageGroupSpec,
    loader: &L,
    config: &PipelineConfig,
    segmenter: &S,
    cancel: &CancelToken,
) -> (ImageRecord, Option<ImageSummary>) {
    let record = |outcome| ImageRecord {
        image_id: group.id.clone(),
        outcome,
    };

    if cancel.is_cancelled() {
        debug!("{}: not started, run cancelled", group.id);
        return (record(ImageOutcome::Cancelled), None);
    }

    let processed = loader.load(group).and_then(|mut inputs| {
        inputs.image_id.clone_from(&group.id);
        crate::process_image_with_segmenter(&inputs, config, segmenter, &StdClock)
    });
    match processed {
        Ok(image) => {
            if let Some(diagnostics) = &image.diagnostics {
                debug!("{}:\n{}", group.id, diagnostics.report());
            }
            (record(ImageOutcome::Succeeded), Some(image))
        }
        Err(reason) => {
            warn!("{}: skipped ({}): {reason}", group.id, reason.kind());
            (record(ImageOutcome::Skipped { reason }), None)
        }
    }
}
