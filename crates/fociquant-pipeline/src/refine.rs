//! Segmentation mask refinement: size-filter raw nucleus instances.
//!
//! The segmentation model returns one label per detected instance,
//! including debris and partial nuclei. Refinement keeps every connected
//! piece with at least `min_object_size_px` pixels and clears the rest.
//! Kept pieces are never merged, grown, or shrunk.

use image::{ImageBuffer, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::label::label_areas;
use crate::types::{BinaryMask, LabelMask, PipelineError};

/// Keep connected pieces with pixel area `>= min_object_size_px`.
///
/// A piece is an 8-connected region of one label value, so a binary mask
/// (every foreground pixel `1`) is filtered per blob, and an instance
/// split into disconnected fragments is filtered per fragment. The result
/// is binary: instance identity is recovered later by watershed
/// separation.
///
/// Every connected component of the output has at least
/// `min_object_size_px` pixels, so refining the output again with the
/// same threshold returns it unchanged. An empty input produces an empty
/// output.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if `min_object_size_px`
/// is zero.
pub fn refine(labels: &LabelMask, min_object_size_px: u64) -> Result<BinaryMask, PipelineError> {
    if min_object_size_px == 0 {
        return Err(PipelineError::InvalidParameter(
            "minimum object size must be at least 1 pixel".to_owned(),
        ));
    }
    let dimensions = labels.dimensions();
    let image: ImageBuffer<Luma<u32>, Vec<u32>> =
        ImageBuffer::from_raw(dimensions.width, dimensions.height, labels.as_slice().to_vec())
            .ok_or_else(|| {
                PipelineError::InvalidParameter(format!("label buffer does not fit {dimensions}"))
            })?;
    let pieces = LabelMask::from_raw(
        dimensions,
        connected_components(&image, Connectivity::Eight, Luma([0u32])).into_raw(),
    )?;
    let areas = label_areas(&pieces);
    let kept: Vec<bool> = pieces
        .as_slice()
        .iter()
        .map(|&piece| piece != 0 && areas.get(&piece).copied().unwrap_or(0) >= min_object_size_px)
        .collect();
    BinaryMask::from_values(dimensions, &kept)
}
