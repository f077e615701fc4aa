//! fociquant: batch foci quantification from the command line.
//!
//! Reads a manifest of image groups (one nucleus label image plus named
//! foci channels each), runs the quantification pipeline over all of
//! them in parallel, and writes per-object, per-nucleus, and per-channel
//! tables plus a JSON run report.
//!
//! # Usage
//!
//! ```text
//! fociquant [OPTIONS] --output-dir <DIR> <MANIFEST>
//! ```

#![allow(clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, ValueEnum};
use flexi_logger::{Logger, LoggerHandle};
use fociquant::{CliError, FsLoader, load_manifest, write_outputs};
use fociquant_export::{ExportError, ReportMetadata};
use fociquant_pipeline::{
    BatchConfig, CancelToken, ColocMode, PipelineConfig, RunSummary, SegmenterKind, run_batch,
};
use log::{error, info, warn};

/// Per-nucleus foci quantification for confocal image sets.
///
/// Every relative path in the manifest is resolved against the
/// manifest's directory.
#[derive(Parser)]
#[command(name = "fociquant", version)]
struct Cli {
    /// Path to the JSON manifest of image groups.
    manifest: PathBuf,

    /// Directory receiving the CSV tables and the run report.
    #[arg(long, short)]
    output_dir: PathBuf,

    /// Nucleus segmentation backend.
    #[arg(long, value_enum, default_value_t = Segmenter::LabelImage)]
    segmenter: Segmenter,

    /// Minimum nucleus size in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MIN_NUCLEUS_SIZE_PX, value_parser = clap::builder::RangedU64ValueParser::<u64>::new().range(1..))]
    min_nucleus_size: u64,

    /// Foci intensity threshold; pixels strictly above it are foreground.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_INTENSITY_THRESHOLD)]
    intensity_threshold: u32,

    /// Watershed seed tolerance in pixels of distance.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SEED_TOLERANCE)]
    seed_tolerance: f64,

    /// Colocalization mode.
    #[arg(long, value_enum, default_value_t = Coloc::None)]
    coloc: Coloc,

    /// Smallest channel subset size for `--coloc all`.
    #[arg(long, default_value_t = 2)]
    coloc_min: usize,

    /// Largest channel subset size for `--coloc all` (default: all channels).
    #[arg(long)]
    coloc_max: Option<usize>,

    /// Explicit channel set, `+`-separated (e.g. `Foci_1+Foci_2`).
    /// Repeatable. Implies explicit colocalization.
    #[arg(long = "coloc-set")]
    coloc_sets: Vec<String>,

    /// Worker threads (0 = all cores).
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,

    /// Log level specification (e.g. `info`, `debug`, `fociquant_pipeline=debug`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Nucleus segmentation backend selection.
#[derive(Clone, Copy, ValueEnum)]
enum Segmenter {
    /// The nucleus source is a label image from an upstream model.
    LabelImage,
    /// Global Otsu threshold on a raw nucleus stain.
    Otsu,
}

/// Colocalization mode selection.
#[derive(Clone, Copy, ValueEnum)]
enum Coloc {
    /// No colocalization.
    None,
    /// Every pair of channels.
    Pairwise,
    /// Every subset between `--coloc-min` and `--coloc-max` channels.
    All,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored. Otherwise, a config is
/// assembled from the individual flags.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, CliError> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(CliError::Config);
    }

    let colocalization = if cli.coloc_sets.is_empty() {
        match cli.coloc {
            Coloc::None => None,
            Coloc::Pairwise => Some(ColocMode::Pairwise),
            Coloc::All => Some(ColocMode::AllSubsets {
                min_size: cli.coloc_min,
                max_size: cli.coloc_max.unwrap_or(usize::MAX),
            }),
        }
    } else {
        Some(ColocMode::Explicit(
            cli.coloc_sets
                .iter()
                .map(|set| set.split('+').map(|name| name.trim().to_owned()).collect())
                .collect(),
        ))
    };

    Ok(PipelineConfig {
        segmenter: match cli.segmenter {
            Segmenter::LabelImage => SegmenterKind::LabelImage,
            Segmenter::Otsu => SegmenterKind::Otsu,
        },
        min_nucleus_size_px: cli.min_nucleus_size,
        intensity_threshold: cli.intensity_threshold,
        seed_tolerance: cli.seed_tolerance,
        colocalization,
    })
}

/// Logging stops when the returned handle is dropped.
fn setup_logging(level: &str) -> Result<LoggerHandle, CliError> {
    Ok(Logger::try_with_str(level)?.log_to_stderr().start()?)
}

fn run(cli: &Cli) -> Result<RunSummary, CliError> {
    let config = config_from_cli(cli)?;
    config.validate()?;
    let config_json = serde_json::to_string(&config).map_err(ExportError::Json)?;
    let manifest = load_manifest(&cli.manifest)?;

    let summary = run_batch(
        &manifest,
        &FsLoader,
        &config,
        &BatchConfig {
            workers: cli.workers,
        },
        &CancelToken::new(),
    )?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default();
    let manifest_path = cli.manifest.display().to_string();
    let metadata = ReportMetadata {
        manifest: Some(&manifest_path),
        timestamp: Some(&timestamp),
        config_json: Some(&config_json),
    };
    write_outputs(&cli.output_dir, &summary, &metadata)?;
    Ok(summary)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _logger = match setup_logging(&cli.log_level) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let summary = match run(&cli) {
        Ok(summary) => summary,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "processed {} image groups: {} succeeded, {} skipped, {} cancelled",
        summary.outcomes.len(),
        summary.succeeded().len(),
        summary.skipped().len(),
        summary.cancelled().len(),
    );
    for (id, reason) in summary.skipped() {
        warn!("skipped {id}: {reason}");
    }

    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        error!("no image group succeeded");
        ExitCode::FAILURE
    }
}
