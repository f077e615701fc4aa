//! Errors raised by the command-line driver itself.
//!
//! Per-image failures never surface here; they are recorded in the
//! [`RunSummary`](fociquant_pipeline::RunSummary) and the run continues.

use std::path::PathBuf;

use fociquant_export::ExportError;
use fociquant_pipeline::PipelineError;

/// Run-level failure of the CLI.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The manifest file could not be read.
    #[error("cannot read manifest {}: {source}", path.display())]
    ManifestRead {
        /// Manifest path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid JSON for a [`Manifest`](fociquant_pipeline::Manifest).
    #[error("invalid manifest {}: {source}", path.display())]
    ManifestParse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// `--config-json` is not a valid `PipelineConfig`.
    #[error("invalid --config-json: {0}")]
    Config(#[source] serde_json::Error),

    /// The configuration or manifest was rejected by the pipeline.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// An output file or directory could not be written.
    #[error("cannot write {}: {source}", path.display())]
    Output {
        /// Path being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A document could not be rendered.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Logging could not be initialized.
    #[error("logger initialization failed: {0}")]
    Logger(#[from] flexi_logger::FlexiLoggerError),
}
