//! Image decoding into calibrated grayscale rasters.
//!
//! Accepts raw image bytes (TIFF or PNG, whatever the `image` crate was
//! built with) and produces a single-channel [`CalibratedImage`]. 16-bit
//! sources keep their native depth, so segmentation label images with
//! more than 255 instances survive decoding; everything else becomes
//! 8-bit luma.

use image::DynamicImage;

use crate::calibration::Calibration;
use crate::types::{CalibratedImage, PipelineError};

/// Decode raw image bytes into a calibrated grayscale image.
///
/// Color sources are converted with the standard luminance weights.
///
/// # Errors
///
/// Returns [`PipelineError::CorruptMask`] if `bytes` is empty and
/// [`PipelineError::ImageDecode`] if the format is unrecognized or the
/// data is corrupt.
pub fn decode_image(
    bytes: &[u8],
    calibration: Calibration,
) -> Result<CalibratedImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::CorruptMask("image data is empty".to_owned()));
    }
    let img = image::load_from_memory(bytes)?;
    Ok(match &img {
        DynamicImage::ImageLuma16(gray) => CalibratedImage::from_gray16(gray, calibration),
        DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => CalibratedImage::from_gray16(&img.to_luma16(), calibration),
        _ => CalibratedImage::from_gray8(&img.to_luma8(), calibration),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::types::{BitDepth, Dimensions};

    fn encode_png(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn empty_input_is_corrupt() {
        let result = decode_image(&[], Calibration::default());
        assert!(matches!(result, Err(PipelineError::CorruptMask(_))));
    }

    #[test]
    fn corrupt_bytes_return_decode_error() {
        let result = decode_image(&[0xFF, 0xFE, 0x00, 0x01], Calibration::default());
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::ImageDecode(_)));
        assert_eq!(err.kind(), "CorruptMask");
    }

    #[test]
    fn eight_bit_png_decodes() {
        let gray =
            image::GrayImage::from_fn(3, 2, |x, y| image::Luma([u8::try_from(x + 10 * y).unwrap()]));
        let bytes = encode_png(&DynamicImage::ImageLuma8(gray));
        let img = decode_image(&bytes, Calibration::default()).unwrap();
        assert_eq!(img.bit_depth(), BitDepth::Eight);
        assert_eq!(img.dimensions(), Dimensions::new(3, 2));
        assert_eq!(img.pixels(), &[0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn sixteen_bit_png_keeps_depth() {
        let gray = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_fn(2, 1, |x, _| {
            image::Luma([if x == 0 { 300 } else { 60_000 }])
        });
        let bytes = encode_png(&DynamicImage::ImageLuma16(gray));
        let img = decode_image(&bytes, Calibration::default()).unwrap();
        assert_eq!(img.bit_depth(), BitDepth::Sixteen);
        assert_eq!(img.pixels(), &[300, 60_000]);
    }

    #[test]
    fn color_png_becomes_luma() {
        let rgb = image::RgbImage::from_fn(2, 2, |_, _| image::Rgb([255, 255, 255]));
        let bytes = encode_png(&DynamicImage::ImageRgb8(rgb));
        let img = decode_image(&bytes, Calibration::default()).unwrap();
        assert_eq!(img.bit_depth(), BitDepth::Eight);
        assert!(img.pixels().iter().all(|&p| p == 255));
    }

    #[test]
    fn calibration_is_attached() {
        let cal = Calibration::square(0.25, "micron").unwrap();
        let gray = image::GrayImage::new(2, 2);
        let bytes = encode_png(&DynamicImage::ImageLuma8(gray));
        let img = decode_image(&bytes, cal.clone()).unwrap();
        assert_eq!(img.calibration(), &cal);
    }
}
