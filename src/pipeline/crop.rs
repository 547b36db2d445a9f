//! Crop primitive: cut a diagram out of a page raster and store it.
//!
//! The linker computes the pixel rectangle; a [`Cropper`] only validates it,
//! cuts it and decides where the PNG lives. [`InlineCropper`] embeds the PNG
//! as a data URI inside the JSON, [`FileCropper`] writes it next to the
//! output. Both are synchronous: the diagram phase calls them from
//! `spawn_blocking`.

use crate::error::CropError;
use crate::geometry::PixelRect;
use crate::model::{DiagramImage, PageContent};
use crate::pipeline::encode;
use std::path::PathBuf;
use tracing::debug;

/// Storage key of one diagram crop: the canonical owner's question number
/// and the diagram id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropKey {
    pub question_number: String,
    pub diagram_id: String,
}

impl CropKey {
    pub fn new(question_number: impl Into<String>, diagram_id: impl Into<String>) -> Self {
        Self {
            question_number: question_number.into(),
            diagram_id: diagram_id.into(),
        }
    }

    /// File-system safe `{question}_{diagram}` stem.
    pub fn file_stem(&self) -> String {
        let question: String = self
            .question_number
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let question = question.trim_matches('_');
        let question = if question.is_empty() { "unnumbered" } else { question };
        format!("{}_{}", question, self.diagram_id)
    }
}

pub trait Cropper: Send + Sync {
    /// Cut `rect` out of `page` and store it.
    ///
    /// Must reject a zero-area rectangle with [`CropError::ZeroArea`].
    fn crop(&self, page: &PageContent, rect: PixelRect, key: &CropKey) -> Result<DiagramImage, CropError>;
}

/// Validate `rect` against the page and return the cropped PNG bytes.
pub fn crop_png(page: &PageContent, rect: PixelRect) -> Result<Vec<u8>, CropError> {
    let (w, h) = (rect.width(), rect.height());
    if w == 0 || h == 0 {
        return Err(CropError::ZeroArea { width: w, height: h });
    }
    if rect.x_max > page.width || rect.y_max > page.height {
        return Err(CropError::OutOfBounds {
            x_max: rect.x_max,
            y_max: rect.y_max,
            page_width: page.width,
            page_height: page.height,
        });
    }
    let region = page.image.crop_imm(rect.x_min, rect.y_min, w, h);
    Ok(encode::png_bytes(&region)?)
}

/// Embeds each crop as a `data:image/png;base64` URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineCropper;

impl Cropper for InlineCropper {
    fn crop(&self, page: &PageContent, rect: PixelRect, key: &CropKey) -> Result<DiagramImage, CropError> {
        let png = crop_png(page, rect)?;
        debug!("Inline crop {} → {} bytes", key.file_stem(), png.len());
        Ok(DiagramImage::Inline {
            data_uri: encode::data_uri(&png),
        })
    }
}

/// Writes each crop to `<dir>/<question>_<diagram>.png`.
#[derive(Debug, Clone)]
pub struct FileCropper {
    dir: PathBuf,
}

impl FileCropper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Cropper for FileCropper {
    fn crop(&self, page: &PageContent, rect: PixelRect, key: &CropKey) -> Result<DiagramImage, CropError> {
        let png = crop_png(page, rect)?;
        let io = |path: &PathBuf, source| CropError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| io(&self.dir, e))?;
        let path = self.dir.join(format!("{}.png", key.file_stem()));
        std::fs::write(&path, &png).map_err(|e| io(&path, e))?;
        debug!("Wrote diagram crop {}", path.display());
        Ok(DiagramImage::File { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    fn page(w: u32, h: u32) -> PageContent {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255])));
        PageContent::new(0, "", img)
    }

    fn rect(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> PixelRect {
        PixelRect {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    #[test]
    fn file_stem_is_sanitised() {
        assert_eq!(CropKey::new("7(a)", "d1").file_stem(), "7_a_d1");
        assert_eq!(CropKey::new("  ", "d2").file_stem(), "unnumbered_d2");
        assert_eq!(CropKey::new("Q3/b", "x").file_stem(), "Q3_b_x");
    }

    #[test]
    fn zero_area_is_rejected() {
        let err = InlineCropper.crop(&page(100, 100), rect(10, 10, 10, 50), &CropKey::new("1", "d"));
        assert!(matches!(err, Err(CropError::ZeroArea { width: 0, height: 40 })));
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let err = crop_png(&page(100, 100), rect(0, 0, 101, 10));
        assert!(matches!(err, Err(CropError::OutOfBounds { .. })));
    }

    #[test]
    fn inline_crop_has_expected_size() {
        let out = InlineCropper
            .crop(&page(200, 100), rect(20, 10, 60, 30), &CropKey::new("2", "d"))
            .unwrap();
        let DiagramImage::Inline { data_uri } = out else {
            panic!("expected inline image");
        };
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let png = STANDARD
            .decode(data_uri.trim_start_matches("data:image/png;base64,"))
            .unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
    }

    #[test]
    fn file_cropper_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let cropper = FileCropper::new(dir.path().join("diagrams"));
        let out = cropper
            .crop(&page(50, 50), rect(0, 0, 25, 25), &CropKey::new("7a", "abc"))
            .unwrap();
        match out {
            DiagramImage::File { path } => {
                assert!(path.ends_with("diagrams/7a_abc.png"));
                assert!(path.exists());
            }
            other => panic!("expected file image, got {other:?}"),
        }
    }
}
