//! fociquant: filesystem and command-line layer.
//!
//! Everything with side effects lives here: reading manifests and
//! rasters, calibration metadata files, logging setup, and writing the
//! output tables. The quantification itself is in `fociquant-pipeline`
//! and the table rendering in `fociquant-export`.

pub mod error;
pub mod loader;
pub mod manifest;
pub mod output;

pub use error::CliError;
pub use loader::FsLoader;
pub use manifest::load_manifest;
pub use output::write_outputs;
