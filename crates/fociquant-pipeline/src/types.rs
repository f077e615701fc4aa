//! Shared types for the fociquant quantification pipeline.

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::coloc::ColocMode;
use crate::diagnostics::PipelineDiagnostics;
use crate::segment::SegmenterKind;

/// Re-export `GrayImage` so downstream crates can reference
/// intermediate raster data without depending on `image` directly.
pub use image::GrayImage;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of pixels (`width * height`).
    #[must_use]
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Native sample depth of a grayscale raster.
///
/// Determines the valid intensity range for thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BitDepth {
    /// 8-bit unsigned samples (`0..=255`).
    #[default]
    Eight,
    /// 16-bit unsigned samples (`0..=65535`).
    Sixteen,
}

impl BitDepth {
    /// Largest representable intensity at this depth.
    #[must_use]
    pub const fn max_value(self) -> u32 {
        match self {
            Self::Eight => u8::MAX as u32,
            Self::Sixteen => u16::MAX as u32,
        }
    }
}

/// A grayscale, single-plane raster with its physical calibration.
///
/// Immutable once constructed. Pipeline stages never modify an image in
/// place; they produce masks from it.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedImage {
    dimensions: Dimensions,
    bit_depth: BitDepth,
    pixels: Vec<u16>,
    calibration: Calibration,
}

impl CalibratedImage {
    /// Build an image from row-major samples.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the sample count does
    /// not match `width * height`, or if any sample exceeds the range of
    /// `bit_depth`.
    pub fn new(
        dimensions: Dimensions,
        bit_depth: BitDepth,
        pixels: Vec<u16>,
        calibration: Calibration,
    ) -> Result<Self, PipelineError> {
        if pixels.len() != dimensions.pixel_count() {
            return Err(PipelineError::InvalidParameter(format!(
                "expected {} samples for a {dimensions} image, got {}",
                dimensions.pixel_count(),
                pixels.len(),
            )));
        }
        let max = bit_depth.max_value();
        if let Some(&bad) = pixels.iter().find(|&&p| u32::from(p) > max) {
            return Err(PipelineError::InvalidParameter(format!(
                "sample value {bad} exceeds the {max} maximum of the image bit depth",
            )));
        }
        Ok(Self {
            dimensions,
            bit_depth,
            pixels,
            calibration,
        })
    }

    /// Wrap an 8-bit grayscale image.
    #[must_use]
    pub fn from_gray8(image: &GrayImage, calibration: Calibration) -> Self {
        Self {
            dimensions: Dimensions::new(image.width(), image.height()),
            bit_depth: BitDepth::Eight,
            pixels: image.as_raw().iter().map(|&p| u16::from(p)).collect(),
            calibration,
        }
    }

    /// Wrap a 16-bit grayscale image.
    #[must_use]
    pub fn from_gray16(
        image: &image::ImageBuffer<image::Luma<u16>, Vec<u16>>,
        calibration: Calibration,
    ) -> Self {
        Self {
            dimensions: Dimensions::new(image.width(), image.height()),
            bit_depth: BitDepth::Sixteen,
            pixels: image.as_raw().clone(),
            calibration,
        }
    }

    /// Image dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Image width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.dimensions.width
    }

    /// Image height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// Native sample depth.
    #[must_use]
    pub const fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    /// Physical calibration.
    #[must_use]
    pub const fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Row-major samples.
    #[must_use]
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Sample at `(x, y)`, or `None` when out of bounds.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        (x < self.dimensions.width && y < self.dimensions.height)
            .then(|| self.pixels[y as usize * self.dimensions.width as usize + x as usize])
    }
}

/// A 2D boolean grid: `true` is foreground.
///
/// The pre-labeling representation of every mask in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    dimensions: Dimensions,
    data: Vec<bool>,
}

impl BinaryMask {
    /// An all-background mask.
    #[must_use]
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            dimensions,
            data: vec![false; dimensions.pixel_count()],
        }
    }

    /// Build a mask by evaluating `f(x, y)` for every pixel.
    #[must_use]
    pub fn from_fn(dimensions: Dimensions, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity(dimensions.pixel_count());
        for y in 0..dimensions.height {
            for x in 0..dimensions.width {
                data.push(f(x, y));
            }
        }
        Self { dimensions, data }
    }

    /// Binarize arbitrary raster values: any non-zero value is foreground.
    ///
    /// Masks read from disk may carry 255, 1, or label values; all of them
    /// are coerced under this single rule rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the value count does
    /// not match `width * height`.
    pub fn from_values<T>(dimensions: Dimensions, values: &[T]) -> Result<Self, PipelineError>
    where
        T: Copy + Default + PartialEq,
    {
        if values.len() != dimensions.pixel_count() {
            return Err(PipelineError::InvalidParameter(format!(
                "expected {} mask values for a {dimensions} mask, got {}",
                dimensions.pixel_count(),
                values.len(),
            )));
        }
        let zero = T::default();
        Ok(Self {
            dimensions,
            data: values.iter().map(|&v| v != zero).collect(),
        })
    }

    /// Render as an 8-bit raster: 255 for foreground, 0 for background.
    #[must_use]
    pub fn to_gray_image(&self) -> GrayImage {
        let raw = self.data.iter().map(|&v| if v { 255 } else { 0 }).collect();
        GrayImage::from_raw(self.dimensions.width, self.dimensions.height, raw)
            .unwrap_or_else(|| GrayImage::new(self.dimensions.width, self.dimensions.height))
    }

    /// Mask dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Whether `(x, y)` is foreground. Out-of-bounds reads are background.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.dimensions.width
            && y < self.dimensions.height
            && self.data[y as usize * self.dimensions.width as usize + x as usize]
    }

    /// Set `(x, y)`. Out-of-bounds writes are ignored.
    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.dimensions.width && y < self.dimensions.height {
            self.data[y as usize * self.dimensions.width as usize + x as usize] = value;
        }
    }

    /// Row-major foreground flags.
    #[must_use]
    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    /// Number of foreground pixels.
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    /// Returns `true` if no pixel is foreground.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&v| v)
    }
}

/// A 2D grid of object labels: `0` is background, each positive value
/// identifies one object.
///
/// Masks produced by [`label::relabel_sequential`](crate::label::relabel_sequential)
/// (and every pipeline stage that returns a `LabelMask`) carry contiguous
/// labels `1..=n`, numbered in row-major order of first occurrence. Raw
/// masks from an external segmenter may have gaps until relabeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMask {
    dimensions: Dimensions,
    labels: Vec<u32>,
}

impl LabelMask {
    /// An all-background label mask.
    #[must_use]
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            dimensions,
            labels: vec![0; dimensions.pixel_count()],
        }
    }

    /// Wrap row-major label values.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the value count does
    /// not match `width * height`.
    pub fn from_raw(dimensions: Dimensions, labels: Vec<u32>) -> Result<Self, PipelineError> {
        if labels.len() != dimensions.pixel_count() {
            return Err(PipelineError::InvalidParameter(format!(
                "expected {} labels for a {dimensions} mask, got {}",
                dimensions.pixel_count(),
                labels.len(),
            )));
        }
        Ok(Self { dimensions, labels })
    }

    /// Mask dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Label at `(x, y)`. Out-of-bounds reads are background.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> u32 {
        if x < self.dimensions.width && y < self.dimensions.height {
            self.labels[y as usize * self.dimensions.width as usize + x as usize]
        } else {
            0
        }
    }

    /// Row-major label values.
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.labels
    }

    /// Largest label value present (0 for an empty mask).
    #[must_use]
    pub fn max_label(&self) -> u32 {
        self.labels.iter().copied().max().unwrap_or(0)
    }

    /// Number of distinct non-zero labels.
    #[must_use]
    pub fn object_count(&self) -> usize {
        let mut seen: Vec<u32> = self.labels.iter().copied().filter(|&l| l != 0).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Collapse every object to foreground.
    #[must_use]
    pub fn to_binary(&self) -> BinaryMask {
        BinaryMask {
            dimensions: self.dimensions,
            data: self.labels.iter().map(|&l| l != 0).collect(),
        }
    }
}

/// Inclusive pixel bounding box of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Leftmost column.
    pub min_x: u32,
    /// Topmost row.
    pub min_y: u32,
    /// Rightmost column.
    pub max_x: u32,
    /// Bottom row.
    pub max_y: u32,
}

/// Geometric measurements of one labeled object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Label value of the object in its source [`LabelMask`].
    pub label_id: u32,
    /// Area in pixels.
    pub area_px: u64,
    /// Area in calibrated units squared (`area_px * pixel_area`).
    pub area_calibrated: f64,
    /// Mean pixel coordinate.
    pub centroid: Point,
    /// Inclusive bounding box.
    pub bbox: BoundingBox,
    /// Nucleus holding the plurality of this object's pixels, if any.
    pub parent_nucleus_id: Option<u32>,
}

/// Roll-up of one channel set's objects inside one nucleus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Channel set identifier (channel name, or `+`-joined names).
    pub channel: String,
    /// Number of objects assigned to the nucleus.
    pub foci_count: u64,
    /// Pixels of those objects lying inside the nucleus.
    pub foci_area_px: u64,
    /// Calibrated area of the same pixels.
    pub foci_area_calibrated: f64,
    /// `100 * foci_area_px / nucleus_area_px`; 0 for a zero-area nucleus.
    pub percent_area_occupied: f64,
}

impl ChannelStats {
    /// Stats for a nucleus with no objects from `channel`.
    #[must_use]
    pub fn empty(channel: &str) -> Self {
        Self {
            channel: channel.to_owned(),
            foci_count: 0,
            foci_area_px: 0,
            foci_area_calibrated: 0.0,
            percent_area_occupied: 0.0,
        }
    }
}

/// One nucleus with its per-channel-set statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NucleusRecord {
    /// Nucleus label, unique within the image.
    pub nucleus_id: u32,
    /// Nucleus area in pixels.
    pub area_px: u64,
    /// Nucleus area in calibrated units squared.
    pub area_calibrated: f64,
    /// Nucleus centroid.
    pub centroid: Point,
    /// Statistics per channel set, in the image's channel-set order.
    pub channels: Vec<ChannelStats>,
}

impl NucleusRecord {
    /// Statistics for `channel`, if that channel set was measured.
    #[must_use]
    pub fn channel(&self, channel: &str) -> Option<&ChannelStats> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

/// Image-level totals for one channel set, including unassigned objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Channel set identifier.
    pub channel: String,
    /// Total objects detected.
    pub object_count: u64,
    /// Objects assigned to a nucleus.
    pub assigned_count: u64,
    /// Objects overlapping no nucleus.
    pub unassigned_count: u64,
    /// Summed pixel area of all objects.
    pub total_area_px: u64,
    /// Summed calibrated area of all objects.
    pub total_area_calibrated: f64,
    /// Mean object area in pixels (0 with no objects).
    pub mean_area_px: f64,
}

/// Objects and totals for one channel set of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResult {
    /// Channel set identifier.
    pub channel: String,
    /// `true` for a colocalization set, `false` for a single channel.
    pub colocalization: bool,
    /// Per-object measurements with parent nucleus assigned.
    pub objects: Vec<ObjectRecord>,
    /// Image-level totals.
    pub summary: ChannelSummary,
}

/// Everything measured for one image group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    /// Stable image identifier from the manifest.
    pub image_id: String,
    /// Calibration used for every area in this summary.
    pub calibration: Calibration,
    /// Image dimensions.
    pub dimensions: Dimensions,
    /// Channel set identifiers in column order: foci channels (sorted),
    /// then colocalization sets in generation order.
    pub channel_sets: Vec<String>,
    /// One record per nucleus, ordered by nucleus id.
    pub nuclei: Vec<NucleusRecord>,
    /// Per-channel-set objects and totals, in `channel_sets` order.
    pub channels: Vec<ChannelResult>,
    /// Non-fatal problems (e.g. skipped colocalization sets).
    pub warnings: Vec<String>,
    /// Per-stage timing and counts, when collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<PipelineDiagnostics>,
}

/// One foci channel of an image group.
#[derive(Debug, Clone, PartialEq)]
pub struct FociChannel {
    /// Channel name (e.g. `Foci_1_Channel_2`).
    pub name: String,
    /// Grayscale foci image.
    pub image: CalibratedImage,
}

/// Loaded inputs for one image group: one nucleus source plus 1..N foci
/// channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInputs {
    /// Stable image identifier.
    pub image_id: String,
    /// Nucleus source handed to the segmenter. Its calibration applies to
    /// the whole group.
    pub nucleus: CalibratedImage,
    /// Foci channels.
    pub foci: Vec<FociChannel>,
}

/// Configuration for the per-image quantification pipeline.
///
/// All parameters have defaults tuned for 8-bit confocal projections.
/// Call [`validate`](Self::validate) before use; [`process_image`](crate::process_image)
/// does so itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Which segmentation backend turns the nucleus source into instances.
    pub segmenter: SegmenterKind,

    /// Minimum nucleus size in pixels. Smaller instances are removed
    /// before and after watershed separation.
    pub min_nucleus_size_px: u64,

    /// Foci intensity threshold in native units. A pixel is foreground
    /// iff its intensity is strictly greater.
    pub intensity_threshold: u32,

    /// Minimum peak height (in pixels of distance) a watershed basin must
    /// rise above a saddle to stay separate.
    pub seed_tolerance: f64,

    /// Which channel combinations to colocalize. `None` disables
    /// colocalization.
    pub colocalization: Option<ColocMode>,
}

impl PipelineConfig {
    /// Default minimum nucleus size (pixels).
    pub const DEFAULT_MIN_NUCLEUS_SIZE_PX: u64 = 2500;
    /// Default foci intensity threshold (8-bit units).
    pub const DEFAULT_INTENSITY_THRESHOLD: u32 = 150;
    /// Default watershed seed tolerance (pixels of distance).
    pub const DEFAULT_SEED_TOLERANCE: f64 = 0.5;

    /// Check parameter ranges that do not depend on the image.
    ///
    /// The intensity threshold is checked against each image's bit depth
    /// by [`threshold::threshold`](crate::threshold::threshold).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for a zero minimum
    /// nucleus size or a negative / non-finite seed tolerance.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.min_nucleus_size_px == 0 {
            return Err(PipelineError::InvalidParameter(
                "minimum nucleus size must be at least 1 pixel".to_owned(),
            ));
        }
        if !self.seed_tolerance.is_finite() || self.seed_tolerance < 0.0 {
            return Err(PipelineError::InvalidParameter(format!(
                "seed tolerance must be a non-negative number, got {}",
                self.seed_tolerance,
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterKind::default(),
            min_nucleus_size_px: Self::DEFAULT_MIN_NUCLEUS_SIZE_PX,
            intensity_threshold: Self::DEFAULT_INTENSITY_THRESHOLD,
            seed_tolerance: Self::DEFAULT_SEED_TOLERANCE,
            colocalization: None,
        }
    }
}

/// Errors that can occur during pipeline processing.
///
/// Uses custom `Serialize`/`Deserialize` because `image::ImageError`
/// does not implement serde traits. The `ImageDecode` variant is
/// serialized as its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A threshold, size, or other parameter is outside its valid range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An expected mask, image, or calibration is absent.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Two rasters that must align have different shapes.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Reference dimensions.
        expected: Dimensions,
        /// Offending dimensions.
        found: Dimensions,
    },

    /// Mask data could not be interpreted at all.
    #[error("corrupt mask: {0}")]
    CorruptMask(String),

    /// Failed to decode an input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),
}

impl PipelineError {
    /// Short machine-readable name of the error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "InvalidParameter",
            Self::MissingInput(_) => "MissingInput",
            Self::DimensionMismatch { .. } => "DimensionMismatch",
            Self::CorruptMask(_) | Self::ImageDecode(_) => "CorruptMask",
        }
    }
}

/// Serde-compatible proxy for `PipelineError`.
///
/// `image::ImageError` does not implement serde, so the `ImageDecode`
/// variant stores its `Display` string instead. A deserialized
/// `ImageDecode` comes back as [`PipelineError::CorruptMask`] with the
/// original message preserved.
#[derive(Serialize, Deserialize)]
enum PipelineErrorProxy {
    InvalidParameter(String),
    MissingInput(String),
    DimensionMismatch {
        expected: Dimensions,
        found: Dimensions,
    },
    CorruptMask(String),
    ImageDecode(String),
}

impl Serialize for PipelineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::InvalidParameter(s) => PipelineErrorProxy::InvalidParameter(s.clone()),
            Self::MissingInput(s) => PipelineErrorProxy::MissingInput(s.clone()),
            Self::DimensionMismatch { expected, found } => PipelineErrorProxy::DimensionMismatch {
                expected: *expected,
                found: *found,
            },
            Self::CorruptMask(s) => PipelineErrorProxy::CorruptMask(s.clone()),
            Self::ImageDecode(e) => PipelineErrorProxy::ImageDecode(e.to_string()),
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = PipelineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            PipelineErrorProxy::InvalidParameter(s) => Self::InvalidParameter(s),
            PipelineErrorProxy::MissingInput(s) => Self::MissingInput(s),
            PipelineErrorProxy::DimensionMismatch { expected, found } => {
                Self::DimensionMismatch { expected, found }
            }
            PipelineErrorProxy::CorruptMask(s) => Self::CorruptMask(s),
            PipelineErrorProxy::ImageDecode(msg) => {
                Self::CorruptMask(format!("image decode error: {msg}"))
            }
        })
    }
}
