//! Base64 image decoding into 8-bit grayscale.
//!
//! Clients send compressed images (JPEG, PNG, ...) as standard base64.
//! Registration and authentication decode them slightly differently, see
//! [`DecodeMode`]. Both honour the EXIF orientation tag, so portrait and
//! mirrored camera shots come out upright.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, GenericImageView, GrayImage, ImageDecoder, ImageReader, Luma, RgbImage};
use std::io::Cursor;
use thiserror::Error;

// BT.601 luma weights in 14-bit fixed point.
const GRAY_R: u32 = 4899;
const GRAY_G: u32 = 9617;
const GRAY_B: u32 = 1868;
const GRAY_SHIFT: u32 = 14;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("unsupported or corrupt image data: {0}")]
    InvalidImage(#[from] image::ImageError),
}

/// How the decoded image is brought down to one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Decode as colour, then convert the RGB image to gray in a second pass.
    Scanning,
    /// Decode straight to gray in a single pass.
    Single,
}

/// Decode a base64-encoded compressed image into a grayscale image.
///
/// ASCII whitespace inside the payload is ignored.
pub fn decode(base: &str, mode: DecodeMode) -> Result<GrayImage, DecodeError> {
    let compact: Vec<u8> = base
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD.decode(compact)?;
    let image = load_oriented(&bytes)?;

    tracing::trace!(
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        ?mode,
        "decoded image"
    );

    Ok(match mode {
        DecodeMode::Scanning => rgb_to_gray(&image.to_rgb8()),
        DecodeMode::Single => to_gray_single_pass(&image),
    })
}

/// Decode compressed bytes and rotate/flip them as the EXIF orientation says.
fn load_oriented(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Convert an RGB image to gray using BT.601 weights.
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y).0;
        Luma([bt601(p[0], p[1], p[2])])
    })
}

fn to_gray_single_pass(image: &DynamicImage) -> GrayImage {
    if !image.color().has_color() {
        return image.to_luma8();
    }
    let mut gray = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.pixels() {
        let [r, g, b, _] = pixel.0;
        gray.put_pixel(x, y, Luma([bt601(r, g, b)]));
    }
    gray
}

#[inline]
fn bt601(r: u8, g: u8, b: u8) -> u8 {
    let sum = r as u32 * GRAY_R + g as u32 * GRAY_G + b as u32 * GRAY_B;
    ((sum + (1 << (GRAY_SHIFT - 1))) >> GRAY_SHIFT) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ImageFormat, Rgb};

    fn encode(image: DynamicImage) -> String {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        STANDARD.encode(buf.into_inner())
    }

    #[test]
    fn test_bt601_primaries() {
        assert_eq!(bt601(255, 0, 0), 76);
        assert_eq!(bt601(0, 255, 0), 150);
        assert_eq!(bt601(0, 0, 255), 29);
        assert_eq!(bt601(255, 255, 255), 255);
        assert_eq!(bt601(0, 0, 0), 0);
    }

    #[test]
    fn test_decode_single_keeps_dimensions() {
        let gray = GrayImage::from_fn(64, 48, |x, y| Luma([((x * 4 + y) % 256) as u8]));
        let decoded = decode(&encode(DynamicImage::ImageLuma8(gray.clone())), DecodeMode::Single).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
        assert_eq!(decoded, gray);
    }

    #[test]
    fn test_decode_scanning_keeps_dimensions() {
        let rgb = RgbImage::from_fn(30, 20, |x, _| Rgb([x as u8 * 8, 100, 50]));
        let decoded = decode(&encode(DynamicImage::ImageRgb8(rgb)), DecodeMode::Scanning).unwrap();
        assert_eq!(decoded.dimensions(), (30, 20));
    }

    #[test]
    fn test_modes_agree_on_colour_input() {
        let rgb = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 77]));
        let payload = encode(DynamicImage::ImageRgb8(rgb));
        let scanning = decode(&payload, DecodeMode::Scanning).unwrap();
        let single = decode(&payload, DecodeMode::Single).unwrap();
        assert_eq!(scanning, single);
    }

    #[test]
    fn test_decode_ignores_whitespace() {
        let gray = GrayImage::from_pixel(8, 8, Luma([200]));
        let payload = encode(DynamicImage::ImageLuma8(gray));
        let wrapped: String = payload
            .as_bytes()
            .chunks(10)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\r\n");
        let decoded = decode(&wrapped, DecodeMode::Single).unwrap();
        assert_eq!(decoded.get_pixel(3, 3).0[0], 200);
    }

    /// JPEG with an APP1 EXIF segment carrying only the given orientation.
    fn encode_jpeg_with_orientation(image: DynamicImage, orientation: u8) -> String {
        let mut jpeg = Vec::new();
        image
            .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, 95))
            .unwrap();

        let mut exif = b"Exif\0\0".to_vec();
        // Big-endian TIFF header, IFD0 at offset 8.
        exif.extend_from_slice(b"MM\0\x2a\0\0\0\x08");
        // One entry: tag 0x0112 (Orientation), SHORT, count 1.
        exif.extend_from_slice(&[0x00, 0x01]);
        exif.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
        exif.extend_from_slice(&[0x00, orientation, 0x00, 0x00]);
        exif.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        let len = (exif.len() + 2) as u16;
        let mut segment = vec![0xFF, 0xE1];
        segment.extend_from_slice(&len.to_be_bytes());
        segment.extend_from_slice(&exif);

        // Right after SOI.
        jpeg.splice(2..2, segment);
        STANDARD.encode(jpeg)
    }

    #[test]
    fn test_exif_rotation_is_applied() {
        let rgb = RgbImage::from_fn(64, 32, |x, _| Rgb([(x * 4) as u8, 90, 40]));
        let payload = encode_jpeg_with_orientation(DynamicImage::ImageRgb8(rgb), 6);

        let single = decode(&payload, DecodeMode::Single).unwrap();
        let scanning = decode(&payload, DecodeMode::Scanning).unwrap();
        assert_eq!(single.dimensions(), (32, 64));
        assert_eq!(scanning.dimensions(), (32, 64));
    }

    #[test]
    fn test_exif_mirror_is_applied() {
        let gray = GrayImage::from_fn(64, 32, |x, _| if x < 32 { Luma([250]) } else { Luma([5]) });
        let payload = encode_jpeg_with_orientation(DynamicImage::ImageLuma8(gray), 2);

        let decoded = decode(&payload, DecodeMode::Single).unwrap();
        assert_eq!(decoded.dimensions(), (64, 32));
        // Bright half now on the right.
        assert!(decoded.get_pixel(4, 16).0[0] < 64);
        assert!(decoded.get_pixel(60, 16).0[0] > 192);
    }

    #[test]
    fn test_untagged_jpeg_keeps_orientation() {
        let rgb = RgbImage::from_pixel(64, 32, Rgb([10, 200, 30]));
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(rgb)
            .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, 95))
            .unwrap();
        let decoded = decode(&STANDARD.encode(jpeg), DecodeMode::Scanning).unwrap();
        assert_eq!(decoded.dimensions(), (64, 32));
    }

    #[test]
    fn test_invalid_base64() {
        let err = decode("not base64 !!!", DecodeMode::Single).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidBase64(_)));
    }

    #[test]
    fn test_invalid_image_bytes() {
        let payload = STANDARD.encode(b"definitely not an image");
        let err = decode(&payload, DecodeMode::Scanning).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidImage(_)));
    }
}
