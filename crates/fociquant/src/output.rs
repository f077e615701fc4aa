//! Output writing.
//!
//! Renders every table and the run report with `fociquant-export` and
//! writes them into one directory:
//!
//! - `objects_<image>_<set>.csv` per image and channel set
//! - `nuclei_summary.csv`
//! - `channel_summary.csv`
//! - `run_report.json`

use std::path::{Path, PathBuf};

use fociquant_export::{
    ReportMetadata, channel_summary_csv, nuclei_summary_csv, objects_csv, objects_file_name,
    run_report_json,
};
use fociquant_pipeline::RunSummary;
use log::{debug, info};

use crate::error::CliError;

/// Nucleus table file name.
pub const NUCLEI_SUMMARY_FILE: &str = "nuclei_summary.csv";
/// Channel table file name.
pub const CHANNEL_SUMMARY_FILE: &str = "channel_summary.csv";
/// Run report file name.
pub const RUN_REPORT_FILE: &str = "run_report.json";

/// Write all outputs of `summary` into `dir`, creating it if needed.
///
/// Returns the written paths in write order.
///
/// # Errors
///
/// Returns [`CliError::Output`] on any I/O failure and
/// [`CliError::Export`] if the report cannot be rendered.
pub fn write_outputs(
    dir: &Path,
    summary: &RunSummary,
    metadata: &ReportMetadata<'_>,
) -> Result<Vec<PathBuf>, CliError> {
    std::fs::create_dir_all(dir).map_err(|source| CliError::Output {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::new();
    for image in &summary.images {
        for channel in &image.channels {
            let path = dir.join(objects_file_name(&image.image_id, &channel.channel));
            write_file(&path, &objects_csv(image, channel))?;
            written.push(path);
        }
    }

    let documents = [
        (NUCLEI_SUMMARY_FILE, nuclei_summary_csv(&summary.images)),
        (CHANNEL_SUMMARY_FILE, channel_summary_csv(&summary.images)),
        (RUN_REPORT_FILE, run_report_json(summary, metadata)?),
    ];
    for (name, contents) in documents {
        let path = dir.join(name);
        write_file(&path, &contents)?;
        written.push(path);
    }

    info!("wrote {} files to {}", written.len(), dir.display());
    Ok(written)
}

fn write_file(path: &Path, contents: &str) -> Result<(), CliError> {
    std::fs::write(path, contents).map_err(|source| CliError::Output {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}
