//! Vision-model collaborator: one page image plus a prompt in, raw text and
//! token usage out.
//!
//! Phase executors talk to [`VisionModel`] only. The production
//! implementation, [`EdgequakeVision`], sends the request through an
//! `edgequake-llm` provider; tests plug in canned replies keyed by task and
//! page.
//!
//! ## No retries
//!
//! Each request is attempted exactly once under a timeout. A failed call is
//! recorded against its page and the page contributes nothing to that
//! phase; the run carries on with the other pages.

use crate::config::{ExtractionConfig, DEFAULT_MODEL};
use crate::error::{ExtractionError, VisionError};
use crate::ledger::TokenUsage;
use crate::pipeline::encode;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What a request is for. Fakes use it to route canned replies; the ledger
/// uses [`VisionTask::operation`] as the operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisionTask {
    QuestionExtraction,
    PageClassification,
    AnswerExtraction,
}

impl VisionTask {
    pub fn operation(self) -> &'static str {
        match self {
            VisionTask::QuestionExtraction => "extract_questions",
            VisionTask::PageClassification => "classify_page",
            VisionTask::AnswerExtraction => "extract_answers",
        }
    }
}

/// One request to the vision model.
#[derive(Clone)]
pub struct VisionRequest {
    pub task: VisionTask,
    /// 0-based page index.
    pub page_index: usize,
    pub system: String,
    pub prompt: String,
    pub image: Option<Arc<DynamicImage>>,
}

impl fmt::Debug for VisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionRequest")
            .field("task", &self.task)
            .field("page_index", &self.page_index)
            .field("prompt_len", &self.prompt.len())
            .field("has_image", &self.image.is_some())
            .finish()
    }
}

/// Raw model output and the tokens it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionReply {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Model label used to price usage in the ledger.
    fn model_name(&self) -> &str;

    async fn generate(&self, request: &VisionRequest) -> Result<VisionReply, VisionError>;
}

/// [`VisionModel`] backed by an `edgequake-llm` provider.
pub struct EdgequakeVision {
    provider: Arc<dyn LLMProvider>,
    model: String,
    options: CompletionOptions,
    timeout: Duration,
}

impl fmt::Debug for EdgequakeVision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgequakeVision")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl EdgequakeVision {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            model: model.into(),
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
            timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
        }
    }

    /// Resolve a provider from the configuration and environment.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, model_label(config), config))
    }
}

#[async_trait]
impl VisionModel for EdgequakeVision {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &VisionRequest) -> Result<VisionReply, VisionError> {
        let mut messages = vec![ChatMessage::system(request.system.as_str())];
        let images = match &request.image {
            Some(img) => vec![encode::encode_page(img).map_err(|e| VisionError::Encode(e.to_string()))?],
            None => Vec::new(),
        };
        messages.push(ChatMessage::user_with_images(request.prompt.as_str(), images));

        let call = self.provider.chat(&messages, Some(&self.options));
        match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                warn!(
                    "Page {}: {} timed out after {:?}",
                    request.page_index + 1,
                    request.task.operation(),
                    self.timeout
                );
                Err(VisionError::Timeout {
                    secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => Err(VisionError::CallFailed {
                message: e.to_string(),
                usage: None,
            }),
            Ok(Ok(response)) => {
                let usage = TokenUsage::new(
                    response.prompt_tokens as u64,
                    response.completion_tokens as u64,
                );
                debug!(
                    "Page {}: {} → {} input tokens, {} output tokens",
                    request.page_index + 1,
                    request.task.operation(),
                    usage.input_tokens,
                    usage.output_tokens
                );
                Ok(VisionReply {
                    text: response.content,
                    usage,
                })
            }
        }
    }
}

/// Model label for accounting: configured model, then `EDGEQUAKE_MODEL`,
/// then [`DEFAULT_MODEL`].
pub fn model_label(config: &ExtractionConfig) -> String {
    if let Some(m) = &config.model {
        return m.clone();
    }
    match std::env::var("EDGEQUAKE_MODEL") {
        Ok(m) if !m.is_empty() => m,
        _ => DEFAULT_MODEL.to_string(),
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ExtractionError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractionError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with the configured model.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set, so a machine with several
///    keys defaults to the cheapest vision model.
/// 5. **Full auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, ExtractionError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_vision_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_vision_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractionError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or GEMINI_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_are_distinct() {
        let ops = [
            VisionTask::QuestionExtraction.operation(),
            VisionTask::PageClassification.operation(),
            VisionTask::AnswerExtraction.operation(),
        ];
        assert_eq!(ops, ["extract_questions", "classify_page", "extract_answers"]);
    }

    #[test]
    fn configured_model_wins_for_label() {
        let config = ExtractionConfig::builder().model("gpt-4o").build().unwrap();
        assert_eq!(model_label(&config), "gpt-4o");
    }

    #[test]
    fn request_debug_omits_image_bytes() {
        let req = VisionRequest {
            task: VisionTask::AnswerExtraction,
            page_index: 3,
            system: "s".into(),
            prompt: "p".repeat(40),
            image: None,
        };
        let dbg = format!("{req:?}");
        assert!(dbg.contains("prompt_len: 40"));
        assert!(dbg.contains("has_image: false"));
    }
}
