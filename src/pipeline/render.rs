//! Document parsing: turn a PDF into ordered [`PageContent`]s via pdfium.
//!
//! The orchestrator only sees the [`DocumentSource`] trait, so tests (and
//! hosts with their own renderer) can hand in pages directly. [`PdfiumSource`]
//! is the default implementation.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is CPU-heavy. `tokio::task::spawn_blocking` moves each document
//! onto the blocking pool so Tokio worker threads never stall while pages
//! are rasterised.
//!
//! ## Why cap pixels, not DPI?
//!
//! Page sizes vary wildly: an A3 paper at 300 DPI is almost 5,000 px tall.
//! `max_rendered_pixels` caps the longest edge regardless of physical size,
//! keeping memory bounded and matching the image-size sweet spot of vision
//! models. The DPI setting only scales pages that would stay under the cap.

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::model::PageContent;
use crate::pipeline::input;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Produces the ordered pages of a document.
///
/// `document` is whatever the caller submitted (path, URL, or a name the
/// implementation understands). Failing here is the only fatal error of a
/// run; an empty page list is reported by the parse phase as
/// [`ExtractionError::NoPages`].
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn parse(&self, document: &str) -> Result<Vec<PageContent>, ExtractionError>;
}

/// pdfium-backed [`DocumentSource`]: text layer plus a raster per page.
#[derive(Debug, Clone)]
pub struct PdfiumSource {
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
    library: Option<PathBuf>,
    download_timeout_secs: u64,
}

impl PdfiumSource {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
            password: config.password.clone(),
            library: config.pdfium_lib_path.clone(),
            download_timeout_secs: config.download_timeout_secs,
        }
    }

    /// Parse a PDF that is already on disk.
    pub async fn parse_path(&self, path: &Path) -> Result<Vec<PageContent>, ExtractionError> {
        let this = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || this.parse_blocking(&path))
            .await
            .map_err(|e| ExtractionError::Internal(format!("Render task panicked: {}", e)))?
    }

    fn parse_blocking(&self, pdf_path: &Path) -> Result<Vec<PageContent>, ExtractionError> {
        let pdfium = bind_pdfium(self.library.as_deref())?;

        let document = pdfium
            .load_pdf_from_file(pdf_path, self.password.as_deref())
            .map_err(|e| classify_load_error(pdf_path, self.password.is_some(), e))?;

        let pages = document.pages();
        info!("PDF loaded: {} pages", pages.len());

        let mut out = Vec::with_capacity(pages.len() as usize);
        for (index, page) in pages.iter().enumerate() {
            let rasterise = |e: PdfiumError| ExtractionError::RasterisationFailed {
                page: index + 1,
                detail: format!("{:?}", e),
            };

            let render_config = self.render_config(page.width().value, page.height().value);
            let image = page
                .render_with_config(&render_config)
                .map_err(rasterise)?
                .as_image();

            // A page without a text layer (a pure scan) is still a page.
            let text = page.text().map(|t| t.all()).unwrap_or_default();

            debug!(
                "Rendered page {} → {}x{} px, {} chars of text",
                index + 1,
                image.width(),
                image.height(),
                text.len()
            );
            out.push(PageContent::new(index, text, image));
        }

        Ok(out)
    }

    fn render_config(&self, width_pt: f32, height_pt: f32) -> PdfRenderConfig {
        let scale = self.dpi as f32 / 72.0;
        let longest = width_pt.max(height_pt) * scale;
        if longest.is_finite() && longest > 0.0 && longest <= self.max_pixels as f32 {
            PdfRenderConfig::new().scale_page_by_factor(scale)
        } else {
            PdfRenderConfig::new()
                .set_target_width(self.max_pixels as i32)
                .set_maximum_height(self.max_pixels as i32)
        }
    }
}

#[async_trait]
impl DocumentSource for PdfiumSource {
    async fn parse(&self, document: &str) -> Result<Vec<PageContent>, ExtractionError> {
        let resolved = input::resolve_input(document, self.download_timeout_secs).await?;
        // `resolved` keeps a downloaded temp file alive until parsing returns.
        self.parse_path(resolved.path()).await
    }
}

/// Bind pdfium from an explicit file or directory, else from the working
/// directory, else from the system library path.
fn bind_pdfium(library: Option<&Path>) -> Result<Pdfium, ExtractionError> {
    let candidate = match library {
        Some(p) if p.is_dir() => Pdfium::pdfium_platform_library_name_at_path(p),
        Some(p) => p.to_path_buf(),
        None => Pdfium::pdfium_platform_library_name_at_path("./"),
    };

    Pdfium::bind_to_library(&candidate)
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| {
            ExtractionError::PdfiumBindingFailed(format!(
                "{:?} (looked for {})",
                e,
                candidate.display()
            ))
        })
}

fn classify_load_error(path: &Path, had_password: bool, err: PdfiumError) -> ExtractionError {
    let detail = format!("{:?}", err);
    if detail.to_ascii_lowercase().contains("password") {
        if had_password {
            ExtractionError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            ExtractionError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        ExtractionError::CorruptPdf {
            path: path.to_path_buf(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_copies_render_settings() {
        let config = ExtractionConfig::builder()
            .dpi(200)
            .max_rendered_pixels(1500)
            .password("s3cret")
            .build()
            .unwrap();
        let source = PdfiumSource::from_config(&config);
        assert_eq!(source.dpi, 200);
        assert_eq!(source.max_pixels, 1500);
        assert_eq!(source.password.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn missing_document_fails_before_pdfium() {
        let source = PdfiumSource::from_config(&ExtractionConfig::default());
        let err = source.parse("/no/such/paper.pdf").await;
        assert!(matches!(err, Err(ExtractionError::FileNotFound { .. })));
    }
}
