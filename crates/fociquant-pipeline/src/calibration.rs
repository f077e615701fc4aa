//! Physical pixel calibration and the metadata store it is read from.
//!
//! Microscope exports carry an `image_metadata.txt` with one block per
//! image:
//!
//! ```text
//! Image Name: image_1.nd2
//! Pixel Width: 0.2071602
//! Pixel Height: 0.2071602
//! Pixel Depth: 0.5
//! Unit: micron
//! ```
//!
//! [`parse_metadata`] turns that text into a [`CalibrationStore`] keyed by
//! the image name without extension. Calibration is resolved once per
//! image group and propagated to every area computation downstream.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Physical size of one pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Pixel width in `unit`.
    pub pixel_width: f64,
    /// Pixel height in `unit`.
    pub pixel_height: f64,
    /// Voxel depth in `unit`, when the source was a z-stack.
    pub pixel_depth: Option<f64>,
    /// Length unit (e.g. `micron`).
    pub unit: String,
}

impl Calibration {
    /// Pixel size used when no metadata matches an image.
    pub const DEFAULT_PIXEL_SIZE: f64 = 0.207_160_2;
    /// Voxel depth used when no metadata matches an image.
    pub const DEFAULT_PIXEL_DEPTH: f64 = 0.5;
    /// Unit used when no metadata matches an image.
    pub const DEFAULT_UNIT: &'static str = "micron";

    /// Build a validated calibration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if either pixel size is
    /// not a positive finite number.
    pub fn new(
        pixel_width: f64,
        pixel_height: f64,
        unit: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let calibration = Self {
            pixel_width,
            pixel_height,
            pixel_depth: None,
            unit: unit.into(),
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Square pixels of side `pixel_size`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `pixel_size` is not
    /// a positive finite number.
    pub fn square(pixel_size: f64, unit: impl Into<String>) -> Result<Self, PipelineError> {
        Self::new(pixel_size, pixel_size, unit)
    }

    /// Check that both pixel sizes are positive and finite.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] otherwise.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [("width", self.pixel_width), ("height", self.pixel_height)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PipelineError::InvalidParameter(format!(
                    "pixel {name} must be positive, got {value}",
                )));
            }
        }
        Ok(())
    }

    /// Area of one pixel in `unit` squared.
    #[must_use]
    pub fn pixel_area(&self) -> f64 {
        self.pixel_width * self.pixel_height
    }

    /// Convert a pixel count to calibrated area.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn area(&self, pixels: u64) -> f64 {
        pixels as f64 * self.pixel_area()
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            pixel_width: Self::DEFAULT_PIXEL_SIZE,
            pixel_height: Self::DEFAULT_PIXEL_SIZE,
            pixel_depth: Some(Self::DEFAULT_PIXEL_DEPTH),
            unit: Self::DEFAULT_UNIT.to_owned(),
        }
    }
}

/// Calibrations keyed by image name (extension stripped).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStore {
    entries: BTreeMap<String, Calibration>,
}

impl CalibrationStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the calibration for `key`.
    pub fn insert(&mut self, key: impl Into<String>, calibration: Calibration) {
        self.entries.insert(key.into(), calibration);
    }

    /// Number of images with calibration.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store holds no calibration.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Calibration whose key occurs inside `filename`.
    ///
    /// Derived files keep the source image name as a substring
    /// (`image_1` → `processed_image_1_foci_projection.tif`). When several
    /// keys match, the longest wins so `image_10` is not shadowed by
    /// `image_1`; equal lengths fall back to key order.
    #[must_use]
    pub fn lookup(&self, filename: &str) -> Option<&Calibration> {
        self.entries
            .iter()
            .filter(|(key, _)| filename.contains(key.as_str()))
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(_, calibration)| calibration)
    }

    /// Calibration for `filename`, or the default when nothing matches.
    #[must_use]
    pub fn resolve(&self, filename: &str) -> Calibration {
        self.lookup(filename).cloned().unwrap_or_else(|| {
            warn!("no calibration metadata matches '{filename}', using defaults");
            Calibration::default()
        })
    }
}

/// Parse an `image_metadata.txt` document.
///
/// Each `Image Name:` line opens a block; the following `Pixel Width:`,
/// `Pixel Height:`, `Pixel Depth:` and `Unit:` lines fill it. Missing or
/// unparsable fields keep their defaults; blocks whose sizes end up
/// invalid are dropped with a warning.
#[must_use]
pub fn parse_metadata(text: &str) -> CalibrationStore {
    let mut store = CalibrationStore::new();
    let mut current: Option<(String, Calibration)> = None;

    for line in text.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix("Image Name:") {
            flush_block(&mut store, current.take());
            current = Some((image_key(name.trim()), Calibration::default()));
            continue;
        }
        let Some((_, calibration)) = current.as_mut() else {
            continue;
        };
        if let Some(value) = line.strip_prefix("Pixel Width:") {
            set_number(&mut calibration.pixel_width, value);
        } else if let Some(value) = line.strip_prefix("Pixel Height:") {
            set_number(&mut calibration.pixel_height, value);
        } else if let Some(value) = line.strip_prefix("Pixel Depth:") {
            let mut depth = calibration.pixel_depth.unwrap_or(Calibration::DEFAULT_PIXEL_DEPTH);
            set_number(&mut depth, value);
            calibration.pixel_depth = Some(depth);
        } else if let Some(value) = line.strip_prefix("Unit:") {
            let unit = value.trim();
            if !unit.is_empty() {
                calibration.unit = unit.to_owned();
            }
        }
    }
    flush_block(&mut store, current);
    store
}

/// Strip the extension from an image name.
fn image_key(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_owned(),
        _ => name.to_owned(),
    }
}

fn set_number(target: &mut f64, raw: &str) {
    match raw.trim().parse::<f64>() {
        Ok(value) => *target = value,
        Err(_) => warn!("ignoring unparsable calibration value '{}'", raw.trim()),
    }
}

fn flush_block(store: &mut CalibrationStore, block: Option<(String, Calibration)>) {
    let Some((key, calibration)) = block else {
        return;
    };
    if key.is_empty() {
        return;
    }
    match calibration.validate() {
        Ok(()) => store.insert(key, calibration),
        Err(e) => warn!("dropping calibration for '{key}': {e}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const METADATA: &str = "\
Image Name: image_1.nd2
Pixel Width: 0.1
Pixel Height: 0.2
Pixel Depth: 0.3
Unit: micron

Image Name: image_10.nd2
Pixel Width: 0.5
Pixel Height: 0.5
Unit: nm
";

    #[test]
    fn parses_every_block() {
        let store = parse_metadata(METADATA);
        assert_eq!(store.len(), 2);
        let first = store.lookup("image_1").unwrap();
        assert!((first.pixel_width - 0.1).abs() < 1e-12);
        assert!((first.pixel_height - 0.2).abs() < 1e-12);
        assert_eq!(first.pixel_depth, Some(0.3));
        assert_eq!(first.unit, "micron");
    }

    #[test]
    fn missing_depth_keeps_default() {
        let store = parse_metadata(METADATA);
        let second = store.lookup("image_10").unwrap();
        assert_eq!(second.pixel_depth, Some(Calibration::DEFAULT_PIXEL_DEPTH));
        assert_eq!(second.unit, "nm");
    }

    #[test]
    fn lookup_matches_derived_filenames() {
        let store = parse_metadata(METADATA);
        let cal = store
            .lookup("processed_image_1_foci_projection.tif")
            .unwrap();
        assert!((cal.pixel_width - 0.1).abs() < 1e-12);
    }

    #[test]
    fn lookup_prefers_longest_key() {
        let store = parse_metadata(METADATA);
        let cal = store.lookup("image_10_nuclei_projection.tif").unwrap();
        assert_eq!(cal.unit, "nm");
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let store = parse_metadata(METADATA);
        assert_eq!(store.resolve("unrelated.tif"), Calibration::default());
    }

    #[test]
    fn unparsable_value_keeps_default() {
        let store = parse_metadata("Image Name: a.tif\nPixel Width: wide\n");
        let cal = store.lookup("a").unwrap();
        assert!((cal.pixel_width - Calibration::DEFAULT_PIXEL_SIZE).abs() < 1e-12);
    }

    #[test]
    fn non_positive_block_is_dropped() {
        let store = parse_metadata("Image Name: a.tif\nPixel Width: 0.0\n");
        assert!(store.is_empty());
    }

    #[test]
    fn new_rejects_non_positive_sizes() {
        assert!(Calibration::new(0.0, 1.0, "micron").is_err());
        assert!(Calibration::new(1.0, f64::NAN, "micron").is_err());
    }

    #[test]
    fn area_scales_by_pixel_area() {
        let cal = Calibration::new(0.5, 2.0, "micron").unwrap();
        assert!((cal.pixel_area() - 1.0).abs() < 1e-12);
        assert!((cal.area(36) - 36.0).abs() < 1e-12);
    }
}
