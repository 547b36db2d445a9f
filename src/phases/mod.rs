//! Phase executors, one module per pipeline phase.
//!
//! ```text
//! parse ──▶ metadata ──▶ questions ──▶ diagrams ──▶ answers
//! (fatal)    (pure)      (fan-out)     (fan-out)    (fan-out, skippable)
//! ```
//!
//! Only [`parse`] can fail a document. Every later phase records its
//! problems in the [`UsageLedger`] and hands back whatever it managed to
//! build. The orchestrator owns sequencing; executors never call each other.

pub mod answers;
pub mod diagrams;
pub mod metadata;
pub mod parse;
pub mod questions;

use crate::config::ExtractionConfig;
use crate::error::{PageError, VisionError};
use crate::ledger::UsageLedger;
use crate::model::Phase;
use crate::pipeline::crop::Cropper;
use crate::pipeline::vision::{VisionModel, VisionRequest};
use std::sync::Arc;

pub const QUESTION_EXTRACTOR: &str = "question_extractor";
pub const DIAGRAM_LINKER: &str = "diagram_linker";
pub const PAGE_CLASSIFIER: &str = "page_classifier";
pub const ANSWER_EXTRACTOR: &str = "answer_extractor";
pub const ANSWER_MERGER: &str = "answer_merger";

/// Everything a phase needs for one document run.
#[derive(Clone)]
pub struct PhaseContext {
    /// Name the document was submitted under, for progress events.
    pub document: String,
    pub config: Arc<ExtractionConfig>,
    pub vision: Arc<dyn VisionModel>,
    pub cropper: Arc<dyn Cropper>,
    pub ledger: Arc<UsageLedger>,
}

impl PhaseContext {
    /// One model call with usage accounting.
    ///
    /// Usage is logged on success, and on failure when the provider
    /// reported any.
    pub async fn call_model(&self, agent: &str, request: &VisionRequest) -> Result<String, VisionError> {
        let model = self.vision.model_name().to_string();
        match self.vision.generate(request).await {
            Ok(reply) => {
                self.ledger
                    .log_usage(agent, request.task.operation(), reply.usage, &model);
                Ok(reply.text)
            }
            Err(e) => {
                if let Some(usage) = e.usage() {
                    self.ledger.log_usage(agent, request.task.operation(), usage, &model);
                }
                Err(e)
            }
        }
    }

    /// Record a page failure and report it to the progress callback.
    pub fn page_failed(&self, agent: &str, phase: Phase, error: &PageError, total_pages: usize) {
        self.ledger.log_page_error(agent, phase, error);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_page_error(&self.document, phase, error.page(), total_pages, &error.to_string());
        }
    }

    pub fn page_done(&self, phase: Phase, page_num: usize, total_pages: usize) {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_page_complete(&self.document, phase, page_num, total_pages);
        }
    }
}
