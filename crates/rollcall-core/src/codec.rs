//! Raster decode/encode for uploaded photos.

use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("empty image payload")]
    Empty,
    #[error("not a decodable image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("png encoding failed: {0}")]
    Encode(#[source] image::ImageError),
}

/// Decode raw image bytes into an 8-bit, 3-channel raster.
///
/// The container format is sniffed from the magic bytes; alpha and
/// higher bit depths are flattened to RGB8.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let image = image::load_from_memory(bytes).map_err(CodecError::Decode)?;
    Ok(image.to_rgb8())
}

/// Encode a raster as PNG bytes.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(CodecError::Encode)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn test_decode_garbage() {
        let result = decode(b"definitely not an image");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_png_preserves_pixels() {
        let image = RgbImage::from_fn(7, 5, |x, y| Rgb([x as u8 * 30, y as u8 * 40, 200]));
        let png = encode_png(&image).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let back = decode(&png).unwrap();
        assert_eq!(back.dimensions(), (7, 5));
        assert_eq!(back.as_raw(), image.as_raw());
    }

    #[test]
    fn test_decode_flattens_alpha() {
        let rgba = image::RgbaImage::from_pixel(3, 3, image::Rgba([10, 20, 30, 128]));
        let mut out = Cursor::new(Vec::new());
        rgba.write_to(&mut out, ImageFormat::Png).unwrap();
        let decoded = decode(&out.into_inner()).unwrap();
        assert_eq!(decoded.get_pixel(1, 1), &Rgb([10, 20, 30]));
    }
}
