//! fociquant-pipeline: Pure foci quantification pipeline (sans-IO).
//!
//! Turns one image group (a nucleus source plus 1..N foci channels) into
//! per-nucleus foci counts and areas through:
//! segmentation -> refinement -> nucleus watershed, and independently
//! threshold -> foci watershed, then optional colocalization and
//! per-nucleus aggregation. [`batch`] drives that per image across a
//! whole manifest.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! rasters and returns structured data. Reading files, writing tables,
//! and logger setup live in the `fociquant` binary.

pub mod aggregate;
pub mod batch;
pub mod calibration;
pub mod coloc;
pub mod decode;
pub mod diagnostics;
pub mod label;
pub mod refine;
pub mod segment;
pub mod threshold;
pub mod types;
pub mod watershed;

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};

pub use aggregate::ChannelObjects;
pub use batch::{
    BatchConfig, CancelToken, GroupLoader, ImageGroupSpec, ImageOutcome, ImageRecord, Manifest,
    RunSummary, run_batch, run_batch_with_segmenter,
};
pub use calibration::{Calibration, CalibrationStore};
pub use coloc::ColocMode;
pub use diagnostics::{Clock, PipelineDiagnostics, StdClock};
pub use segment::{Segmenter, SegmenterKind};
pub use types::{
    BinaryMask, BitDepth, CalibratedImage, ChannelResult, ChannelStats, ChannelSummary,
    Dimensions, FociChannel, ImageInputs, ImageSummary, LabelMask, NucleusRecord, ObjectRecord,
    PipelineConfig, PipelineError, Point,
};

use diagnostics::{PipelineSummary, StageDiagnostics, StageMetrics, timed};

/// Run the per-image pipeline.
///
/// Same as [`process_image_with_diagnostics`] with [`StdClock`], minus
/// the diagnostics, so two runs over the same inputs compare equal.
///
/// # Errors
///
/// See [`process_image_with_diagnostics`].
pub fn process_image(
    inputs: &ImageInputs,
    config: &PipelineConfig,
) -> Result<ImageSummary, PipelineError> {
    let mut summary = process_image_with_diagnostics(inputs, config, &StdClock)?;
    summary.diagnostics = None;
    Ok(summary)
}

/// Run the per-image pipeline and collect per-stage diagnostics.
///
/// Nuclei are segmented by `config.segmenter`; see
/// [`process_image_with_segmenter`] for a caller-supplied backend.
///
/// # Errors
///
/// See [`process_image_with_segmenter`].
pub fn process_image_with_diagnostics<C: Clock + Sync>(
    inputs: &ImageInputs,
    config: &PipelineConfig,
    clock: &C,
) -> Result<ImageSummary, PipelineError> {
    process_image_with_segmenter(inputs, config, &config.segmenter, clock)
}

/// Run the per-image pipeline with an explicit nucleus segmenter.
///
/// `config.segmenter` is ignored in favor of `segmenter`.
///
/// # Pipeline steps
///
/// 1. Segment the nucleus source into instances (pluggable strategy)
/// 2. Refine: drop connected pieces below `min_nucleus_size_px`
/// 3. Watershed-separate touching nuclei, size-filter again, measure
/// 4. Threshold every foci channel (strictly above the threshold)
/// 5. Watershed-separate touching foci, measure
/// 6. Optional colocalization of channel sets
/// 7. Assign objects to nuclei and roll up per nucleus
///
/// Steps 1-3 and 4-5 run concurrently. Every area uses the nucleus
/// source's calibration.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] for an invalid config,
/// duplicate channel names, or a threshold outside a channel's range,
/// and [`PipelineError::MissingInput`] when the group has no foci
/// channel. A foci channel whose shape differs from the nucleus source
/// is dropped with a warning, along with every colocalization set that
/// names it; [`PipelineError::DimensionMismatch`] is returned only when
/// no channel matches.
pub fn process_image_with_segmenter<S, C>(
    inputs: &ImageInputs,
    config: &PipelineConfig,
    segmenter: &S,
    clock: &C,
) -> Result<ImageSummary, PipelineError>
where
    S: Segmenter + Sync + ?Sized,
    C: Clock + Sync,
{
    config.validate()?;
    validate_inputs(inputs)?;
    let start = clock.now();
    let calibration = inputs.nucleus.calibration().clone();
    let dimensions = inputs.nucleus.dimensions();

    let (usable, mismatched): (Vec<&FociChannel>, Vec<&FociChannel>) = inputs
        .foci
        .iter()
        .partition(|c| c.image.dimensions() == dimensions);
    let mut warnings = Vec::new();
    for channel in &mismatched {
        let e = PipelineError::DimensionMismatch {
            expected: dimensions,
            found: channel.image.dimensions(),
        };
        if usable.is_empty() {
            return Err(e);
        }
        warn!("{}: dropping foci channel {}: {e}", inputs.image_id, channel.name);
        warnings.push(format!("foci channel {} skipped: {e}", channel.name));
    }
    let dropped: Vec<&str> = mismatched.iter().map(|c| c.name.as_str()).collect();

    let (nuclei, foci) = rayon::join(
        || nucleus_stages(inputs, config, segmenter, clock),
        || foci_stages(inputs, &usable, config, clock),
    );
    let nuclei = nuclei?;
    let foci = foci?;

    let coloc = match &config.colocalization {
        Some(mode) => Some(coloc_stage(mode, &foci.channels, &dropped, config, clock)?),
        None => None,
    };
    if let Some(coloc) = &coloc {
        warnings.extend(coloc.warnings.iter().cloned());
    }

    let mut channels: Vec<ChannelObjects<'_>> = foci
        .channels
        .iter()
        .map(|c| ChannelObjects {
            channel: c.name.clone(),
            colocalization: false,
            labels: &c.labels,
            objects: label::measure(&c.labels, &calibration),
        })
        .collect();
    if let Some(coloc) = &coloc {
        channels.extend(coloc.sets.iter().map(|c| ChannelObjects {
            channel: c.name.clone(),
            colocalization: true,
            labels: &c.labels,
            objects: label::measure(&c.labels, &calibration),
        }));
    }

    let (aggregated, aggregation_duration) = timed(clock, || {
        aggregate::aggregate(&nuclei.labels, &nuclei.objects, channels)
    });
    let (records, results) = aggregated?;
    let assigned_count: u64 = results.iter().map(|r| r.summary.assigned_count).sum();
    let unassigned_count: u64 = results.iter().map(|r| r.summary.unassigned_count).sum();
    debug!(
        "{}: assigned {assigned_count} objects, {unassigned_count} outside nuclei",
        inputs.image_id,
    );

    let channel_sets: Vec<String> = results.iter().map(|r| r.channel.clone()).collect();
    let diagnostics = PipelineDiagnostics {
        segmentation: nuclei.segmentation,
        refine: nuclei.refine,
        nucleus_separation: nuclei.separation,
        threshold: foci.threshold,
        foci_separation: foci.separation,
        colocalization: coloc.as_ref().map(|c| c.diagnostics.clone()),
        aggregation: StageDiagnostics {
            duration: aggregation_duration,
            metrics: StageMetrics::Aggregation {
                assigned_count,
                unassigned_count,
            },
        },
        total_duration: clock.elapsed(&start),
        summary: PipelineSummary {
            image_width: dimensions.width,
            image_height: dimensions.height,
            pixel_count: dimensions.pixel_count() as u64,
            nucleus_count: records.len(),
            channel_set_count: channel_sets.len(),
        },
    };

    info!(
        "{}: {} nuclei, {} channel sets",
        inputs.image_id,
        records.len(),
        channel_sets.len(),
    );

    Ok(ImageSummary {
        image_id: inputs.image_id.clone(),
        calibration,
        dimensions,
        channel_sets,
        nuclei: records,
        channels: results,
        warnings,
        diagnostics: Some(diagnostics),
    })
}

/// Checks that need no pixel work. Shape mismatches are handled per channel.
fn validate_inputs(inputs: &ImageInputs) -> Result<(), PipelineError> {
    if inputs.foci.is_empty() {
        return Err(PipelineError::MissingInput(format!(
            "image group '{}' has no foci channels",
            inputs.image_id,
        )));
    }
    let mut seen = HashSet::new();
    for channel in &inputs.foci {
        if !seen.insert(channel.name.as_str()) {
            return Err(PipelineError::InvalidParameter(format!(
                "duplicate foci channel name '{}'",
                channel.name,
            )));
        }
    }
    Ok(())
}

/// Separated, size-filtered nuclei and the timing of how they were made.
struct NucleusStages {
    labels: LabelMask,
    objects: Vec<ObjectRecord>,
    segmentation: StageDiagnostics,
    refine: StageDiagnostics,
    separation: StageDiagnostics,
}

fn nucleus_stages<S: Segmenter + ?Sized, C: Clock>(
    inputs: &ImageInputs,
    config: &PipelineConfig,
    segmenter: &S,
    clock: &C,
) -> Result<NucleusStages, PipelineError> {
    let min_size = config.min_nucleus_size_px;

    let (raw, segmentation_duration) = timed(clock, || segmenter.segment(&inputs.nucleus));
    let raw = raw?;
    if raw.dimensions() != inputs.nucleus.dimensions() {
        return Err(PipelineError::DimensionMismatch {
            expected: inputs.nucleus.dimensions(),
            found: raw.dimensions(),
        });
    }
    let instance_count = raw.object_count();
    debug!("{}: segmentation found {instance_count} instances", inputs.image_id);

    let (refined, refine_duration) = timed(clock, || refine::refine(&raw, min_size));
    let refined = refined?;
    // Instances with at least one surviving piece.
    let kept_count = raw
        .as_slice()
        .iter()
        .zip(refined.as_slice())
        .filter(|&(&label, &kept)| label != 0 && kept)
        .map(|(&label, _)| label)
        .collect::<HashSet<u32>>()
        .len();
    let removed_count = instance_count - kept_count;
    debug!(
        "{}: refinement kept {kept_count} instances, removed {removed_count}",
        inputs.image_id,
    );

    let ((labels, split_count), separation_duration) = timed(clock, || {
        let separated = watershed::separate(&refined, config.seed_tolerance);
        let split_count = separated.object_count();
        (label::filter_by_size(&separated, min_size), split_count)
    });
    let nucleus_count = labels.object_count();
    let objects = label::measure(&labels, inputs.nucleus.calibration());
    debug!("{}: {nucleus_count} nuclei after separation", inputs.image_id);

    Ok(NucleusStages {
        labels,
        objects,
        segmentation: StageDiagnostics {
            duration: segmentation_duration,
            metrics: StageMetrics::Segmentation {
                backend: segmenter.name(),
                instance_count,
            },
        },
        refine: StageDiagnostics {
            duration: refine_duration,
            metrics: StageMetrics::Refine {
                min_object_size_px: min_size,
                removed_count,
                kept_pixels: refined.count() as u64,
            },
        },
        separation: StageDiagnostics {
            duration: separation_duration,
            metrics: StageMetrics::NucleusSeparation {
                nucleus_count,
                dropped_count: split_count - nucleus_count,
            },
        },
    })
}

/// One foci channel (or colocalization set) after separation.
struct SeparatedChannel {
    name: String,
    labels: LabelMask,
}

struct FociStages {
    /// Sorted by channel name.
    channels: Vec<SeparatedChannel>,
    threshold: StageDiagnostics,
    separation: StageDiagnostics,
}

fn foci_stages<C: Clock>(
    inputs: &ImageInputs,
    foci: &[&FociChannel],
    config: &PipelineConfig,
    clock: &C,
) -> Result<FociStages, PipelineError> {
    let mut ordered = foci.to_vec();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    let mut threshold_duration = Duration::ZERO;
    let mut separation_duration = Duration::ZERO;
    let mut foreground_pixels = 0u64;
    let mut object_count = 0usize;
    let mut channels = Vec::with_capacity(ordered.len());

    for channel in ordered {
        let (mask, elapsed) = timed(clock, || {
            threshold::threshold(&channel.image, config.intensity_threshold)
        });
        let mask = mask?;
        threshold_duration += elapsed;
        foreground_pixels += mask.count() as u64;

        let (labels, elapsed) = timed(clock, || watershed::separate(&mask, config.seed_tolerance));
        separation_duration += elapsed;
        object_count += labels.object_count();
        debug!(
            "{}: channel {} has {} foci",
            inputs.image_id,
            channel.name,
            labels.object_count(),
        );
        channels.push(SeparatedChannel {
            name: channel.name.clone(),
            labels,
        });
    }

    Ok(FociStages {
        threshold: StageDiagnostics {
            duration: threshold_duration,
            metrics: StageMetrics::Threshold {
                intensity_threshold: config.intensity_threshold,
                channel_count: channels.len(),
                foreground_pixels,
            },
        },
        separation: StageDiagnostics {
            duration: separation_duration,
            metrics: StageMetrics::FociSeparation { object_count },
        },
        channels,
    })
}

struct ColocStage {
    sets: Vec<SeparatedChannel>,
    warnings: Vec<String>,
    diagnostics: StageDiagnostics,
}

/// Sets naming a channel in `dropped` are skipped with a warning.
fn coloc_stage<C: Clock>(
    mode: &ColocMode,
    foci: &[SeparatedChannel],
    dropped: &[&str],
    config: &PipelineConfig,
    clock: &C,
) -> Result<ColocStage, PipelineError> {
    let names: Vec<String> = foci
        .iter()
        .map(|c| c.name.clone())
        .chain(dropped.iter().map(|&name| name.to_owned()))
        .collect();
    let requested = mode.channel_sets(&names)?;
    let start = clock.now();

    let mut sets = Vec::with_capacity(requested.len());
    let mut warnings = Vec::new();
    for set in &requested {
        let id = coloc::channel_set_id(set);
        if let Some(missing) = set.iter().find(|name| dropped.contains(&name.as_str())) {
            warn!("skipping colocalization set {id}: channel {missing} was dropped");
            warnings.push(format!(
                "colocalization set {id} skipped: channel {missing} was dropped",
            ));
            continue;
        }
        let masks: Vec<&LabelMask> = set
            .iter()
            .filter_map(|name| foci.iter().find(|c| &c.name == name))
            .map(|c| &c.labels)
            .collect();
        match coloc::colocalize(&masks, config.seed_tolerance) {
            Ok(labels) => sets.push(SeparatedChannel { name: id, labels }),
            Err(e @ PipelineError::DimensionMismatch { .. }) => {
                warn!("skipping colocalization set {id}: {e}");
                warnings.push(format!("colocalization set {id} skipped: {e}"));
            }
            Err(e) => return Err(e),
        }
    }

    let object_count = sets.iter().map(|s| s.labels.object_count()).sum();
    Ok(ColocStage {
        diagnostics: StageDiagnostics {
            duration: clock.elapsed(&start),
            metrics: StageMetrics::Colocalization {
                set_count: requested.len(),
                skipped_count: warnings.len(),
                object_count,
            },
        },
        sets,
        warnings,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cal() -> Calibration {
        Calibration::square(0.5, "micron").unwrap()
    }

    /// 8-bit image with `value` inside each `(x0, y0, x1, y1)` rectangle.
    fn image(dims: Dimensions, rects: &[(u32, u32, u32, u32)], value: u16) -> CalibratedImage {
        let pixels = (0..dims.height)
            .flat_map(|y| (0..dims.width).map(move |x| (x, y)))
            .map(|(x, y)| {
                if rects
                    .iter()
                    .any(|&(x0, y0, x1, y1)| x >= x0 && x < x1 && y >= y0 && y < y1)
                {
                    value
                } else {
                    0
                }
            })
            .collect();
        CalibratedImage::new(dims, BitDepth::Eight, pixels, cal()).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            min_nucleus_size_px: 10,
            ..PipelineConfig::default()
        }
    }

    /// One 6x6 nucleus with a 2x2 focus inside it, in a 10x10 image.
    fn single_nucleus_inputs() -> ImageInputs {
        let dims = Dimensions::new(10, 10);
        ImageInputs {
            image_id: "img".to_owned(),
            nucleus: image(dims, &[(2, 2, 8, 8)], 1),
            foci: vec![FociChannel {
                name: "Foci_1".to_owned(),
                image: image(dims, &[(4, 4, 6, 6)], 200),
            }],
        }
    }

    #[test]
    fn single_focus_inside_nucleus() {
        let summary = process_image(&single_nucleus_inputs(), &config()).unwrap();
        assert_eq!(summary.nuclei.len(), 1);
        let nucleus = &summary.nuclei[0];
        assert_eq!(nucleus.area_px, 36);
        let stats = nucleus.channel("Foci_1").unwrap();
        assert_eq!(stats.foci_count, 1);
        assert_eq!(stats.foci_area_px, 4);
        assert!((stats.percent_area_occupied - 11.111).abs() < 1e-3);
        assert!((stats.foci_area_calibrated - 1.0).abs() < 1e-12);
        assert_eq!(summary.channel_sets, vec!["Foci_1".to_owned()]);
        assert!(summary.diagnostics.is_none());
    }

    #[test]
    fn small_nuclei_are_dropped() {
        let dims = Dimensions::new(20, 10);
        let inputs = ImageInputs {
            image_id: "img".to_owned(),
            // Instance 1 is 36 px, instance 2 is 4 px.
            nucleus: CalibratedImage::new(
                dims,
                BitDepth::Eight,
                image(dims, &[(1, 1, 7, 7)], 1)
                    .pixels()
                    .iter()
                    .zip(image(dims, &[(12, 2, 14, 4)], 2).pixels())
                    .map(|(a, b)| a + b)
                    .collect(),
                cal(),
            )
            .unwrap(),
            foci: vec![FociChannel {
                name: "A".to_owned(),
                image: image(dims, &[(12, 2, 13, 3)], 255),
            }],
        };
        let summary = process_image(&inputs, &config()).unwrap();
        assert_eq!(summary.nuclei.len(), 1);
        assert_eq!(summary.channels[0].summary.unassigned_count, 1);
    }

    #[test]
    fn colocalization_adds_channel_sets() {
        let dims = Dimensions::new(10, 10);
        let mut inputs = single_nucleus_inputs();
        inputs.foci.push(FociChannel {
            name: "Foci_2".to_owned(),
            image: image(dims, &[(5, 5, 7, 7)], 200),
        });
        let cfg = PipelineConfig {
            colocalization: Some(ColocMode::Pairwise),
            ..config()
        };
        let summary = process_image(&inputs, &cfg).unwrap();
        assert_eq!(summary.channel_sets, vec!["Foci_1", "Foci_2", "Foci_1+Foci_2"]);
        let coloc = summary.nuclei[0].channel("Foci_1+Foci_2").unwrap();
        assert_eq!(coloc.foci_count, 1);
        assert_eq!(coloc.foci_area_px, 1);
        assert!(summary.channels[2].colocalization);
    }

    #[test]
    fn foci_channels_are_sorted_by_name() {
        let dims = Dimensions::new(10, 10);
        let mut inputs = single_nucleus_inputs();
        inputs.foci.insert(
            0,
            FociChannel {
                name: "Zeta".to_owned(),
                image: image(dims, &[], 0),
            },
        );
        let summary = process_image(&inputs, &config()).unwrap();
        assert_eq!(summary.channel_sets, vec!["Foci_1", "Zeta"]);
        assert_eq!(summary.nuclei[0].channel("Zeta").unwrap().foci_count, 0);
    }

    #[test]
    fn image_without_a_matching_channel_fails() {
        let mut inputs = single_nucleus_inputs();
        inputs.foci[0].image = image(Dimensions::new(9, 10), &[], 0);
        assert!(matches!(
            process_image(&inputs, &config()),
            Err(PipelineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn mismatched_channel_is_dropped_and_others_kept() {
        let mut inputs = single_nucleus_inputs();
        inputs.foci.push(FociChannel {
            name: "Foci_2".to_owned(),
            image: image(Dimensions::new(9, 10), &[(4, 4, 6, 6)], 200),
        });
        let cfg = PipelineConfig {
            colocalization: Some(ColocMode::Pairwise),
            ..config()
        };
        let summary = process_image(&inputs, &cfg).unwrap();
        assert_eq!(summary.channel_sets, vec!["Foci_1"]);
        let stats = summary.nuclei[0].channel("Foci_1").unwrap();
        assert_eq!(stats.foci_count, 1);
        assert_eq!(stats.foci_area_px, 4);
        assert!(summary.nuclei[0].channel("Foci_2").is_none());
        assert!(summary.nuclei[0].channel("Foci_1+Foci_2").is_none());
        assert_eq!(summary.warnings.len(), 2);
        assert!(summary.warnings[0].contains("Foci_2"));
        assert!(summary.warnings[1].contains("Foci_1+Foci_2"));
    }

    /// Treats the whole `(2, 2)..(8, 8)` square as one nucleus, whatever
    /// the source holds.
    struct FixedSquare;

    impl Segmenter for FixedSquare {
        fn segment(&self, image: &CalibratedImage) -> Result<LabelMask, PipelineError> {
            let dims = image.dimensions();
            let raw = (0..dims.pixel_count())
                .map(|i| {
                    let (x, y) = (i % dims.width as usize, i / dims.width as usize);
                    u32::from((2..8).contains(&x) && (2..8).contains(&y))
                })
                .collect();
            LabelMask::from_raw(dims, raw)
        }
    }

    #[test]
    fn caller_supplied_segmenter_is_used() {
        let mut inputs = single_nucleus_inputs();
        inputs.nucleus = image(Dimensions::new(10, 10), &[], 0);

        // The configured label-image backend sees no nucleus here.
        assert!(process_image(&inputs, &config()).unwrap().nuclei.is_empty());

        let summary =
            process_image_with_segmenter(&inputs, &config(), &FixedSquare, &StdClock).unwrap();
        assert_eq!(summary.nuclei.len(), 1);
        assert_eq!(summary.nuclei[0].area_px, 36);
        assert_eq!(summary.nuclei[0].channel("Foci_1").unwrap().foci_count, 1);
        let segmentation = summary.diagnostics.unwrap().segmentation;
        assert!(matches!(
            segmentation.metrics,
            StageMetrics::Segmentation { ref backend, instance_count: 1 }
                if backend.ends_with("FixedSquare")
        ));
    }

    #[test]
    fn missing_foci_is_missing_input() {
        let mut inputs = single_nucleus_inputs();
        inputs.foci.clear();
        assert!(matches!(
            process_image(&inputs, &config()),
            Err(PipelineError::MissingInput(_))
        ));
    }

    #[test]
    fn duplicate_channel_names_are_rejected() {
        let mut inputs = single_nucleus_inputs();
        inputs.foci.push(inputs.foci[0].clone());
        assert!(matches!(
            process_image(&inputs, &config()),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let cfg = PipelineConfig {
            intensity_threshold: 1000,
            ..config()
        };
        assert!(matches!(
            process_image(&single_nucleus_inputs(), &cfg),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn empty_nucleus_source_yields_no_rows() {
        let mut inputs = single_nucleus_inputs();
        inputs.nucleus = image(Dimensions::new(10, 10), &[], 0);
        let summary = process_image(&inputs, &config()).unwrap();
        assert!(summary.nuclei.is_empty());
        assert_eq!(summary.channels[0].summary.object_count, 1);
    }

    #[test]
    fn diagnostics_are_collected() {
        let cfg = PipelineConfig {
            colocalization: Some(ColocMode::Pairwise),
            ..config()
        };
        let summary =
            process_image_with_diagnostics(&single_nucleus_inputs(), &cfg, &StdClock).unwrap();
        let diag = summary.diagnostics.unwrap();
        assert_eq!(diag.summary.nucleus_count, 1);
        assert_eq!(diag.summary.pixel_count, 100);
        // A single channel has no pairs.
        assert!(matches!(
            diag.colocalization.unwrap().metrics,
            StageMetrics::Colocalization { set_count: 0, .. }
        ));
    }

    #[test]
    fn repeated_runs_are_identical() {
        let a = process_image(&single_nucleus_inputs(), &config()).unwrap();
        let b = process_image(&single_nucleus_inputs(), &config()).unwrap();
        assert_eq!(a, b);
    }
}
