//! Filesystem [`GroupLoader`].
//!
//! Reads and decodes the rasters of one image group and resolves its
//! calibration:
//!
//! 1. inline `calibration` in the manifest group;
//! 2. otherwise the group's `metadata` file, matched on the nucleus
//!    source's file name;
//! 3. otherwise the defaults.
//!
//! Every raster of the group is tagged with the same calibration.

use std::path::Path;

use fociquant_pipeline::calibration::parse_metadata;
use fociquant_pipeline::decode::decode_image;
use fociquant_pipeline::{
    CalibratedImage, Calibration, FociChannel, GroupLoader, ImageGroupSpec, ImageInputs,
    PipelineError,
};
use log::debug;

/// Loads image groups from local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsLoader;

impl GroupLoader for FsLoader {
    fn load(&self, group: &ImageGroupSpec) -> Result<ImageInputs, PipelineError> {
        let calibration = resolve_calibration(group)?;
        debug!(
            "{}: calibration {} x {} {}",
            group.id, calibration.pixel_width, calibration.pixel_height, calibration.unit
        );
        let nucleus = read_image(&group.nucleus, &calibration)?;
        let foci = group
            .foci
            .iter()
            .map(|(name, path)| {
                Ok(FociChannel {
                    name: name.clone(),
                    image: read_image(path, &calibration)?,
                })
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;
        Ok(ImageInputs {
            image_id: group.id.clone(),
            nucleus,
            foci,
        })
    }
}

/// Calibration for `group`.
///
/// # Errors
///
/// Returns [`PipelineError::MissingInput`] if the group names a metadata
/// file that cannot be read.
pub fn resolve_calibration(group: &ImageGroupSpec) -> Result<Calibration, PipelineError> {
    if let Some(calibration) = &group.calibration {
        calibration.validate()?;
        return Ok(calibration.clone());
    }
    let Some(metadata) = &group.metadata else {
        return Ok(Calibration::default());
    };
    let text = std::fs::read_to_string(metadata).map_err(|e| {
        PipelineError::MissingInput(format!("metadata {}: {e}", metadata.display()))
    })?;
    let file_name = group
        .nucleus
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parse_metadata(&text).resolve(&file_name))
}

fn read_image(path: &Path, calibration: &Calibration) -> Result<CalibratedImage, PipelineError> {
    let bytes = std::fs::read(path)
        .map_err(|e| PipelineError::MissingInput(format!("{}: {e}", path.display())))?;
    decode_image(&bytes, calibration.clone()).map_err(|e| match e {
        PipelineError::ImageDecode(inner) => {
            PipelineError::CorruptMask(format!("{}: {inner}", path.display()))
        }
        other => other,
    })
}
