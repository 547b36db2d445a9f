//! Input resolution: turn a submitted document name (path or URL) into a
//! local PDF file the parser can open.
//!
//! ## Why download to a temp file?
//!
//! pdfium opens files by path. Downloading to a `TempDir` gives it one, and
//! the directory is removed when [`ResolvedInput`] is dropped, even if the
//! run is cancelled. The `%PDF` magic is checked up front so a mislabelled
//! HTML error page fails as [`ExtractionError::NotAPdf`] instead of deep
//! inside pdfium.

use crate::error::ExtractionError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A local PDF ready for parsing. Temporary copies live as long as this value.
pub enum ResolvedInput {
    /// The document was already a local file.
    Local(PathBuf),
    /// The document was downloaded or written from memory into a temp dir.
    Temporary { path: PathBuf, _dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Temporary { path, .. } => path,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Short display name for a submitted document: the file stem of a path,
/// or the last URL segment without its extension.
///
/// Used for metadata heuristics and output file names; falls back to the
/// input itself when nothing better can be derived.
pub fn document_name(input: &str) -> String {
    let tail = if is_url(input) {
        reqwest::Url::parse(input)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(str::to_string))
            })
            .filter(|s| !s.is_empty())
    } else {
        Some(input.to_string())
    };

    tail.as_deref()
        .map(Path::new)
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| input.to_string())
}

/// Resolve a document name to a local PDF.
///
/// URLs are downloaded into a temporary directory; local paths are checked
/// for existence, readability and the `%PDF` magic.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, ExtractionError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

/// Write in-memory PDF bytes to a temporary file.
pub fn resolve_bytes(bytes: &[u8], file_name: &str) -> Result<ResolvedInput, ExtractionError> {
    let dir = TempDir::new().map_err(|e| ExtractionError::Internal(format!("tempdir: {e}")))?;
    let name = Path::new(file_name)
        .file_name()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| std::ffi::OsStr::new("document.pdf"));
    let path = dir.path().join(name);
    check_magic(&path, bytes)?;
    std::fs::write(&path, bytes)
        .map_err(|e| ExtractionError::Internal(format!("Failed to write temp file: {e}")))?;
    Ok(ResolvedInput::Temporary { path, _dir: dir })
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, ExtractionError> {
    let path = PathBuf::from(path_str);
    if !path.exists() {
        return Err(ExtractionError::FileNotFound { path });
    }

    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractionError::PermissionDenied { path });
        }
        Err(_) => return Err(ExtractionError::FileNotFound { path }),
    };

    let mut head = [0u8; 4];
    let read = file.read(&mut head).unwrap_or(0);
    check_magic(&path, &head[..read])?;

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Reject anything that does not start with `%PDF`. Inputs shorter than
/// four bytes are left for pdfium to report as corrupt.
fn check_magic(path: &Path, bytes: &[u8]) -> Result<(), ExtractionError> {
    if bytes.len() >= 4 && &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(ExtractionError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, ExtractionError> {
    info!("Downloading PDF from: {}", url);
    let failed = |reason: String| ExtractionError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractionError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    let stem = document_name(url);
    let file_name = if stem.contains(['/', '\\', ':']) {
        "downloaded.pdf".to_string()
    } else {
        format!("{stem}.pdf")
    };
    let resolved = tokio::task::spawn_blocking(move || resolve_bytes(&bytes, &file_name))
        .await
        .map_err(|e| ExtractionError::Internal(format!("download write task: {e}")))??;

    info!("Downloaded to: {}", resolved.path().display());
    Ok(resolved)
}
