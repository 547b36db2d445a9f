//! Image encoding: `DynamicImage` → PNG bytes, base64 `ImageData` for the
//! model, or a `data:` URI for inline diagram storage.
//!
//! PNG is chosen over JPEG because it is lossless: thin strokes in geometry
//! figures and small subscripts survive, and JPEG ringing around printed
//! text confuses vision models.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// PNG-encode an image.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Encode a rasterised page as a base64 PNG ready for the vision API.
///
/// ## Why `detail: "high"`?
/// OpenAI's tiling algorithm divides images into 512 px tiles. `detail: "high"`
/// enables the full tile budget so mark allocations, option labels and the
/// small print of answer keys stay legible. `detail: "low"` forces a single
/// 512 px overview tile and bounding boxes become guesswork.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let b64 = STANDARD.encode(png_bytes(img)?);
    debug!("Encoded page image → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// `data:image/png;base64,…` URI for embedding a crop in JSON output.
pub fn data_uri(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn encode_small_image() {
        let data = encode_page(&red(10, 10)).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn data_uri_has_png_prefix() {
        let png = png_bytes(&red(2, 3)).unwrap();
        let uri = data_uri(&png);
        assert!(uri.starts_with("data:image/png;base64,iVBOR"));
    }
}
