//! Nucleus segmentation: turn the nucleus source into raw instances.
//!
//! This module defines the [`Segmenter`] trait and the [`SegmenterKind`]
//! enum for choosing a backend at runtime.
//!
//! # Strategy pattern
//!
//! Instance segmentation normally happens upstream in a deep-learning
//! model whose output is a label image (pixel value = instance id). That
//! model is external to this crate, so [`SegmenterKind::LabelImage`]
//! simply reads those ids. [`SegmenterKind::Otsu`] is a classical
//! fallback for raw DAPI images when no model output is available.
//! Either way the result is a [`LabelMask`] that refinement filters by
//! size. Any other backend implements [`Segmenter`] and is passed to
//! [`crate::process_image_with_segmenter`] or
//! [`crate::batch::run_batch_with_segmenter`].

use serde::{Deserialize, Serialize};

use crate::label::label_components;
use crate::types::{BinaryMask, BitDepth, CalibratedImage, GrayImage, LabelMask, PipelineError};

/// Selects which segmentation backend produces nucleus instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmenterKind {
    /// The nucleus source is already an instance label image.
    ///
    /// Every distinct non-zero pixel value is one instance.
    #[default]
    LabelImage,

    /// Global Otsu threshold followed by 8-connected labeling.
    ///
    /// 16-bit sources are reduced to their high byte before the
    /// histogram is built.
    Otsu,
}

/// Trait for nucleus segmentation backends.
///
/// Input: the nucleus source image. Output: one label per instance,
/// 0 = background, with the source's dimensions.
pub trait Segmenter {
    /// Segment the nucleus source into instances.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CorruptMask`] if the source cannot be
    /// interpreted by this backend.
    fn segment(&self, image: &CalibratedImage) -> Result<LabelMask, PipelineError>;

    /// Backend name recorded in diagnostics.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_owned()
    }
}

impl Segmenter for SegmenterKind {
    fn segment(&self, image: &CalibratedImage) -> Result<LabelMask, PipelineError> {
        match *self {
            Self::LabelImage => segment_label_image(image),
            Self::Otsu => Ok(segment_otsu(image)),
        }
    }

    fn name(&self) -> String {
        format!("{self:?}")
    }
}

/// Read instance ids directly from pixel values.
fn segment_label_image(image: &CalibratedImage) -> Result<LabelMask, PipelineError> {
    let labels = image.pixels().iter().map(|&p| u32::from(p)).collect();
    LabelMask::from_raw(image.dimensions(), labels)
        .map_err(|e| PipelineError::CorruptMask(format!("nucleus label image: {e}")))
}

/// Otsu foreground, labeled into 8-connected components.
fn segment_otsu(image: &CalibratedImage) -> LabelMask {
    let dimensions = image.dimensions();
    let gray = to_gray8(image);
    let level = imageproc::contrast::otsu_level(&gray);
    let mask = BinaryMask::from_fn(dimensions, |x, y| gray.get_pixel(x, y).0[0] > level);
    label_components(&mask)
}

/// 8-bit view of an image. 16-bit sources keep their high byte.
fn to_gray8(image: &CalibratedImage) -> GrayImage {
    let shift = match image.bit_depth() {
        BitDepth::Eight => 0,
        BitDepth::Sixteen => 8,
    };
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let value = image.get(x, y).unwrap_or(0) >> shift;
        image::Luma([u8::try_from(value).unwrap_or(u8::MAX)])
    })
}
