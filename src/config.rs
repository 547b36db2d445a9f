//! Configuration types for exam-paper extraction.
//!
//! Every knob the orchestrator, phase executors and batch runner read lives in
//! [`ExtractionConfig`], built through [`ExtractionConfigBuilder`]. The config
//! is passed explicitly into [`crate::orchestrator::Orchestrator::new`] and
//! never read from globals, so a test can run two orchestrators side by side
//! with different rate tables or scales.
//!
//! # Design choice: builder over constructor
//! Twenty-odd fields with sensible defaults: callers set only what they care
//! about and the builder clamps or rejects values that would break a run.

use crate::error::ExtractionError;
use crate::ledger::RateTable;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for an extraction run.
///
/// # Example
/// ```rust
/// use edgequake_exam2json::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .concurrency(8)
///     .model("gpt-4.1-mini")
///     .extract_answers(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 8);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Max in-flight page tasks per document and phase. Default: 5.
    ///
    /// Bounds simultaneous model calls against one provider. Lower it if the
    /// provider starts answering `429`.
    pub concurrency: usize,

    /// Max documents processed at once by the batch runner. Default: 2.
    pub max_concurrent_documents: usize,

    /// LLM model identifier, e.g. "gpt-4.1-mini", "gemini-2.0-flash".
    /// If None, uses provider default. Also selects the rate-table entry.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 8192.
    ///
    /// A dense page with worked solutions easily runs past 4 000 output
    /// tokens of JSON; truncation turns into a malformed-response error.
    pub max_tokens: usize,

    /// Per-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Rendering DPI hint (72–400). Default: 150.
    pub dpi: u32,

    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Path to a pdfium shared library (file or containing directory).
    /// If None, looks next to the executable and then in system paths.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Maximum coordinate of the model's bounding-box grid. Default: 1000.
    pub inference_scale: f64,

    /// Padding added around each diagram crop, in pixels. Default: 8.
    pub crop_padding_px: u32,

    /// Confidence assigned to diagrams whose descriptor carried none. Default: 0.9.
    pub default_diagram_confidence: f64,

    /// Run the diagram-linking phase. Default: true.
    pub extract_diagrams: bool,

    /// Run the answer detection/extraction phase. Default: true.
    pub extract_answers: bool,

    /// Ask the model to classify pages the keyword heuristic did not flag
    /// as answer pages. Default: false (heuristic only).
    pub model_page_classification: bool,

    /// Per-document deadline in batch mode, in seconds. None = no deadline.
    pub document_timeout_secs: Option<u64>,

    /// Per-model token prices used for cost accounting.
    pub rates: RateTable,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_concurrent_documents: 2,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 8192,
            api_timeout_secs: 120,
            dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
            pdfium_lib_path: None,
            download_timeout_secs: 120,
            inference_scale: 1000.0,
            crop_padding_px: 8,
            default_diagram_confidence: 0.9,
            extract_diagrams: true,
            extract_answers: true,
            model_page_classification: false,
            document_timeout_secs: None,
            rates: RateTable::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("concurrency", &self.concurrency)
            .field("max_concurrent_documents", &self.max_concurrent_documents)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("dpi", &self.dpi)
            .field("inference_scale", &self.inference_scale)
            .field("crop_padding_px", &self.crop_padding_px)
            .field("extract_diagrams", &self.extract_diagrams)
            .field("extract_answers", &self.extract_answers)
            .field("model_page_classification", &self.model_page_classification)
            .field("document_timeout_secs", &self.document_timeout_secs)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ExtractionProgressCallback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model label used for cost accounting when none is configured.
    pub fn model_label(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_concurrent_documents(mut self, n: usize) -> Self {
        self.config.max_concurrent_documents = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn inference_scale(mut self, max: f64) -> Self {
        self.config.inference_scale = max;
        self
    }

    pub fn crop_padding_px(mut self, px: u32) -> Self {
        self.config.crop_padding_px = px;
        self
    }

    pub fn default_diagram_confidence(mut self, c: f64) -> Self {
        self.config.default_diagram_confidence = c.clamp(0.0, 1.0);
        self
    }

    pub fn extract_diagrams(mut self, v: bool) -> Self {
        self.config.extract_diagrams = v;
        self
    }

    pub fn extract_answers(mut self, v: bool) -> Self {
        self.config.extract_answers = v;
        self
    }

    pub fn model_page_classification(mut self, v: bool) -> Self {
        self.config.model_page_classification = v;
        self
    }

    pub fn document_timeout_secs(mut self, secs: u64) -> Self {
        self.config.document_timeout_secs = Some(secs);
        self
    }

    pub fn rates(mut self, rates: RateTable) -> Self {
        self.config.rates = rates;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractionError> {
        let c = &self.config;
        if c.concurrency == 0 || c.max_concurrent_documents == 0 {
            return Err(ExtractionError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if !(c.inference_scale.is_finite() && c.inference_scale > 0.0) {
            return Err(ExtractionError::InvalidConfig(format!(
                "Inference scale must be a positive number, got {}",
                c.inference_scale
            )));
        }
        if c.max_tokens == 0 {
            return Err(ExtractionError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        if c.document_timeout_secs == Some(0) {
            return Err(ExtractionError::InvalidConfig(
                "Document timeout must be ≥ 1s".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.inference_scale, 1000.0);
        assert_eq!(c.default_diagram_confidence, 0.9);
        assert!(c.extract_diagrams && c.extract_answers);
        assert!(!c.model_page_classification);
        assert_eq!(c.model_label(), DEFAULT_MODEL);
    }

    #[test]
    fn builder_clamps() {
        let c = ExtractionConfig::builder()
            .concurrency(0)
            .temperature(9.0)
            .dpi(10)
            .default_diagram_confidence(4.0)
            .build()
            .unwrap();
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.dpi, 72);
        assert_eq!(c.default_diagram_confidence, 1.0);
    }

    #[test]
    fn builder_rejects_bad_scale() {
        let err = ExtractionConfig::builder().inference_scale(0.0).build();
        assert!(matches!(err, Err(ExtractionError::InvalidConfig(_))));
    }

    #[test]
    fn builder_rejects_zero_timeout() {
        let err = ExtractionConfig::builder().document_timeout_secs(0).build();
        assert!(err.is_err());
    }

    #[test]
    fn debug_hides_provider() {
        let c = ExtractionConfig::builder().model("gpt-4o").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(dbg.contains("gpt-4o"));
        assert_eq!(c.model_label(), "gpt-4o");
    }
}
