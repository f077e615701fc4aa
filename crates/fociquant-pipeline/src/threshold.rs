//! Intensity thresholding of a foci channel.
//!
//! A pixel is foci foreground iff its intensity is strictly greater than
//! the threshold. A threshold equal to the bit depth's maximum therefore
//! selects nothing, and a threshold of zero selects every non-zero pixel.

use crate::types::{BinaryMask, CalibratedImage, PipelineError};

/// Build a binary foci mask: foreground iff `intensity > threshold`.
///
/// Raising the threshold never adds foreground pixels.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] if `threshold` exceeds
/// the maximum intensity of the image's bit depth.
pub fn threshold(image: &CalibratedImage, threshold: u32) -> Result<BinaryMask, PipelineError> {
    let max = image.bit_depth().max_value();
    if threshold > max {
        return Err(PipelineError::InvalidParameter(format!(
            "intensity threshold {threshold} is outside the image's range 0..={max}",
        )));
    }
    let foreground: Vec<bool> = image
        .pixels()
        .iter()
        .map(|&p| u32::from(p) > threshold)
        .collect();
    BinaryMask::from_values(image.dimensions(), &foreground)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::types::{BitDepth, Dimensions};

    /// 16x16 horizontal ramp: intensity `x * 16 + y` (0..=255).
    fn ramp() -> CalibratedImage {
        let pixels = (0..16u16)
            .flat_map(|y| (0..16u16).map(move |x| x * 16 + y))
            .collect();
        CalibratedImage::new(
            Dimensions::new(16, 16),
            BitDepth::Eight,
            pixels,
            Calibration::default(),
        )
        .unwrap()
    }

    #[test]
    fn boundary_is_strict() {
        let img = CalibratedImage::new(
            Dimensions::new(3, 1),
            BitDepth::Eight,
            vec![149, 150, 151],
            Calibration::default(),
        )
        .unwrap();
        let mask = threshold(&img, 150).unwrap();
        assert_eq!(mask.as_slice(), &[false, false, true]);
    }

    #[test]
    fn max_threshold_selects_nothing() {
        let mask = threshold(&ramp(), 255).unwrap();
        assert!(mask.is_empty());
    }

    #[test]
    fn zero_threshold_selects_non_zero_pixels() {
        let mask = threshold(&ramp(), 0).unwrap();
        assert_eq!(mask.count(), 255);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        assert!(matches!(
            threshold(&ramp(), 256),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn sixteen_bit_range_accepts_large_thresholds() {
        let img = CalibratedImage::new(
            Dimensions::new(2, 1),
            BitDepth::Sixteen,
            vec![1000, 60000],
            Calibration::default(),
        )
        .unwrap();
        let mask = threshold(&img, 50000).unwrap();
        assert_eq!(mask.as_slice(), &[false, true]);
        assert!(threshold(&img, 70000).is_err());
    }

    #[test]
    fn raising_threshold_never_adds_foreground() {
        let img = ramp();
        let mut previous = usize::MAX;
        for t in 0..=255 {
            let count = threshold(&img, t).unwrap().count();
            assert!(count <= previous, "count rose at threshold {t}");
            previous = count;
        }
    }

    #[test]
    fn output_dimensions_match_input() {
        let mask = threshold(&ramp(), 100).unwrap();
        assert_eq!(mask.dimensions(), Dimensions::new(16, 16));
    }
}
