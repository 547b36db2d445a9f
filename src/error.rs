//! Error types for the edgequake-exam2json library.
//!
//! Failures come in three weights, and each has its own type:
//!
//! * [`ExtractionError`]: **Fatal** for one document. The paper cannot be
//!   opened, has no pages, or the configuration is unusable. Returned as
//!   `Err(ExtractionError)` from the orchestrator. In batch mode it becomes a
//!   per-document failure entry and siblings keep running.
//!
//! * [`PageError`]: **Non-fatal**, scoped to one page or one diagram. A model
//!   call failed, a response could not be decoded, a crop was degenerate. The
//!   page contributes nothing for that phase and the run continues. Every
//!   `PageError` is recorded in the usage ledger and surfaces in
//!   [`crate::model::ExtractionMetrics::errors`].
//!
//! * Collaborator leaf errors ([`VisionError`], [`CropError`],
//!   [`DecodeError`]) are what the external boundaries return. The phase
//!   executors translate them into `PageError`s.

use crate::ledger::TokenUsage;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-exam2json library.
#[derive(Debug, Error)]
pub enum ExtractionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Exam paper not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Parse errors ──────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The document parsed but yielded no pages.
    #[error("Document '{document}' has no pages")]
    NoPages { document: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Batch errors ──────────────────────────────────────────────────────
    /// A document exceeded the per-document deadline and was abandoned.
    #[error("Extraction of '{document}' timed out after {secs}s")]
    DocumentTimeout { document: String, secs: u64 },

    /// The task running a document panicked or was cancelled.
    #[error("Extraction task for '{document}' did not complete: {detail}")]
    TaskFailed { document: String, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium from https://github.com/bblanchon/pdfium-binaries and either:\n\
  • place libpdfium next to the binary or in a system library directory, or\n\
  • set PDFIUM_LIB_PATH=/path/to/libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error scoped to one page (or one diagram on a page).
///
/// `page` is always 1-indexed, matching what a reader sees in the paper.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The combined question/diagram extraction call failed.
    #[error("Page {page}: question extraction failed: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    /// A model call timed out.
    #[error("Page {page}: model call timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// A collaborator answered with something that does not decode.
    #[error("Page {page}: malformed response: {detail}")]
    MalformedResponse { page: usize, detail: String },

    /// Page classification failed; the page is treated as a question page.
    #[error("Page {page}: classification failed: {detail}")]
    ClassificationFailed { page: usize, detail: String },

    /// Answer extraction failed for an answer-key page.
    #[error("Page {page}: answer extraction failed: {detail}")]
    AnswerExtractionFailed { page: usize, detail: String },

    /// One diagram descriptor was dropped (no box, crop failure, no target).
    #[error("Page {page}: diagram dropped: {detail}")]
    DiagramDropped { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ExtractionFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::MalformedResponse { page, .. }
            | PageError::ClassificationFailed { page, .. }
            | PageError::AnswerExtractionFailed { page, .. }
            | PageError::DiagramDropped { page, .. } => *page,
        }
    }

    /// Map a failed vision call onto the page-level error for `phase_failure`.
    ///
    /// Timeouts keep their own variant; everything else is wrapped by the
    /// caller-supplied constructor.
    pub fn from_vision(
        page: usize,
        err: &VisionError,
        phase_failure: fn(usize, String) -> PageError,
    ) -> PageError {
        match err {
            VisionError::Timeout { secs, .. } => PageError::Timeout { page, secs: *secs },
            other => phase_failure(page, other.to_string()),
        }
    }
}

/// Failure of a single vision-model call.
///
/// Calls may have consumed tokens even when they fail (e.g. a truncated
/// reply), so the error carries whatever usage the provider reported.
#[derive(Debug, Clone, Error)]
pub enum VisionError {
    /// The provider rejected or failed the request.
    #[error("model call failed: {message}")]
    CallFailed {
        message: String,
        usage: Option<TokenUsage>,
    },

    /// The call did not finish within the configured timeout.
    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The page image could not be encoded for upload.
    #[error("could not encode page image: {0}")]
    Encode(String),
}

impl VisionError {
    /// Token usage reported alongside the failure, if any.
    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            VisionError::CallFailed { usage, .. } => *usage,
            _ => None,
        }
    }
}

/// Failure of the crop primitive.
#[derive(Debug, Error)]
pub enum CropError {
    /// The pixel rectangle has no area.
    #[error("crop rectangle has zero area ({width}x{height} px)")]
    ZeroArea { width: u32, height: u32 },

    /// The pixel rectangle extends beyond the page raster.
    #[error("crop rectangle {x_max}x{y_max} exceeds page {page_width}x{page_height}")]
    OutOfBounds {
        x_max: u32,
        y_max: u32,
        page_width: u32,
        page_height: u32,
    },

    /// PNG encoding of the cropped region failed.
    #[error("could not encode diagram crop: {0}")]
    Encode(#[from] image::ImageError),

    /// Writing the crop to disk failed.
    #[error("could not write diagram crop to '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A collaborator response that could not be decoded into its schema.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No JSON object could be located in the response text.
    #[error("no JSON object found in response ({len} chars)")]
    NoJson { len: usize },

    /// JSON was found but does not match the expected shape.
    #[error("response does not match schema: {0}")]
    Schema(#[from] serde_json::Error),
}
