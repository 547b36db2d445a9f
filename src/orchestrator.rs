//! Per-document pipeline: five phases in dependency order, driven as an
//! explicit state machine.
//!
//! ```text
//! Started ─▶ Parsed ─▶ MetadataResolved ─▶ QuestionsExtracted ─▶ DiagramsLinked ─▶ AnswersMerged ─▶ Finalized
//!    │
//!    └──▶ Failed   (parse errors only)
//! ```
//!
//! ## Why only parsing is fatal
//!
//! Without pages there is no document. Every later phase works page by page
//! and records its failures in the [`UsageLedger`], so a run always reaches
//! `Finalized` with whatever it managed to extract, and
//! `metrics.errors` says what was lost.
//!
//! ## Cancellation
//!
//! The ledger is finalised by a [`LedgerGuard`] held for the whole run.
//! Dropping the `run` future (an aborted task, a batch deadline) still
//! closes the ledger with the partial totals it has.

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::ledger::{LedgerGuard, RunCounts, UsageLedger};
use crate::model::{ExamPaper, Phase};
use crate::phases::{self, answers, diagrams, metadata, parse, questions, PhaseContext};
use crate::pipeline::crop::{Cropper, InlineCropper};
use crate::pipeline::input::{self, document_name};
use crate::pipeline::render::{DocumentSource, PdfiumSource};
use crate::pipeline::vision::{EdgequakeVision, VisionModel};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

const ORCHESTRATOR: &str = "orchestrator";

/// Where a document run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Started,
    Parsed,
    MetadataResolved,
    QuestionsExtracted,
    DiagramsLinked,
    AnswersMerged,
    Finalized,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Started => "started",
            RunState::Parsed => "parsed",
            RunState::MetadataResolved => "metadata_resolved",
            RunState::QuestionsExtracted => "questions_extracted",
            RunState::DiagramsLinked => "diagrams_linked",
            RunState::AnswersMerged => "answers_merged",
            RunState::Finalized => "finalized",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Runs the extraction pipeline for one document at a time.
///
/// Cheap to clone: every collaborator is behind an `Arc`. The batch runner
/// clones one orchestrator into each document task.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<ExtractionConfig>,
    source: Arc<dyn DocumentSource>,
    vision: Arc<dyn VisionModel>,
    cropper: Arc<dyn Cropper>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("model", &self.vision.model_name())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: ExtractionConfig,
        source: Arc<dyn DocumentSource>,
        vision: Arc<dyn VisionModel>,
        cropper: Arc<dyn Cropper>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            vision,
            cropper,
        }
    }

    /// Production wiring: pdfium pages, an `edgequake-llm` provider and
    /// inline crops.
    ///
    /// # Errors
    /// [`ExtractionError::ProviderNotConfigured`] when no provider can be
    /// resolved from the config or the environment.
    pub fn from_config(config: ExtractionConfig) -> Result<Self, ExtractionError> {
        let source = Arc::new(PdfiumSource::from_config(&config));
        let vision = Arc::new(EdgequakeVision::from_config(&config)?);
        Ok(Self::new(config, source, vision, Arc::new(InlineCropper)))
    }

    /// Replace the crop primitive, e.g. with a [`crate::pipeline::crop::FileCropper`].
    pub fn with_cropper(mut self, cropper: Arc<dyn Cropper>) -> Self {
        self.cropper = cropper;
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract one document (local path or URL) with a fresh ledger.
    ///
    /// # Errors
    /// Only when the document cannot be parsed into pages.
    pub async fn run(&self, document: &str) -> Result<ExamPaper, ExtractionError> {
        let ledger = Arc::new(UsageLedger::new(self.config.rates.clone()));
        self.run_with_ledger(document, ledger).await
    }

    /// Extract in-memory PDF bytes. `file_name` stands in for the path in
    /// metadata heuristics.
    pub async fn extract_from_bytes(&self, bytes: &[u8], file_name: &str) -> Result<ExamPaper, ExtractionError> {
        let resolved = input::resolve_bytes(bytes, file_name)?;
        let path = resolved.path().to_string_lossy().into_owned();
        // `resolved` owns the temp dir; keep it alive until the run ends
        let paper = self.run(&path).await;
        drop(resolved);
        paper
    }

    /// Extract one document against a caller-supplied ledger.
    ///
    /// The ledger is finalised before this returns, and also when the
    /// returned future is dropped early, so the caller can always read the
    /// final metrics from it.
    pub async fn run_with_ledger(
        &self,
        document: &str,
        ledger: Arc<UsageLedger>,
    ) -> Result<ExamPaper, ExtractionError> {
        let _guard = LedgerGuard::new(Arc::clone(&ledger));
        let run_id = ledger.start_run();
        let name = document_name(document);
        let cb = self.config.progress_callback.clone();
        let mut state = RunState::Started;
        info!("Starting extraction of {} (run {})", document, run_id);

        // ── Phase 1: Parse ───────────────────────────────────────────────
        if let Some(ref cb) = cb {
            cb.on_phase_start(&name, Phase::Parse);
        }
        let pages = match parse::run(self.source.as_ref(), document).await {
            Ok(pages) => pages,
            Err(e) => {
                error!("Failed to parse {}: {}", document, e);
                ledger.log_error(ORCHESTRATOR, Phase::Parse, None, e.to_string());
                advance(&name, &mut state, RunState::Failed);
                ledger.end_run();
                if let Some(ref cb) = cb {
                    cb.on_document_failed(&name, &e.to_string());
                }
                return Err(e);
            }
        };
        advance(&name, &mut state, RunState::Parsed);
        if let Some(ref cb) = cb {
            cb.on_document_start(&name, pages.len());
        }

        // ── Phase 2: Metadata ────────────────────────────────────────────
        if let Some(ref cb) = cb {
            cb.on_phase_start(&name, Phase::Metadata);
        }
        let metadata = metadata::run(document, &pages);
        advance(&name, &mut state, RunState::MetadataResolved);

        let ctx = PhaseContext {
            document: name.clone(),
            config: Arc::clone(&self.config),
            vision: Arc::clone(&self.vision),
            cropper: Arc::clone(&self.cropper),
            ledger: Arc::clone(&ledger),
        };

        // ── Phase 3: Questions + diagram descriptors ─────────────────────
        if let Some(ref cb) = cb {
            cb.on_phase_start(&name, Phase::Questions);
        }
        ledger.record_agent(phases::QUESTION_EXTRACTOR);
        let extracted = questions::run(&ctx, &pages).await;
        advance(&name, &mut state, RunState::QuestionsExtracted);

        // ── Phase 3b: Diagram linking ────────────────────────────────────
        let mut forest = if self.config.extract_diagrams {
            if let Some(ref cb) = cb {
                cb.on_phase_start(&name, Phase::Diagrams);
            }
            diagrams::run(&ctx, &pages, extracted).await.questions
        } else {
            diagrams::assemble(extracted)
        };
        advance(&name, &mut state, RunState::DiagramsLinked);

        // ── Phase 4: Answers ─────────────────────────────────────────────
        let answers = if self.config.extract_answers {
            if let Some(ref cb) = cb {
                cb.on_phase_start(&name, Phase::Answers);
            }
            answers::run(&ctx, &pages, &mut forest).await
        } else {
            answers::AnswersOutcome::default()
        };
        advance(&name, &mut state, RunState::AnswersMerged);

        // ── Phase 5: Finalize ────────────────────────────────────────────
        if let Some(ref cb) = cb {
            cb.on_phase_start(&name, Phase::Finalize);
        }
        let questions_extracted: usize = forest.iter().map(|q| q.node_count()).sum();
        let diagrams_extracted = {
            let mut ids = HashSet::new();
            for q in crate::model::flatten(&forest) {
                ids.extend(q.diagrams.iter().map(|d| d.id.as_str()));
            }
            ids.len()
        };
        ledger.record_counts(RunCounts {
            pages_processed: pages.len(),
            questions_extracted,
            diagrams_extracted,
            answers_merged: answers.merged,
        });
        let metrics = ledger.end_run();
        advance(&name, &mut state, RunState::Finalized);

        info!(
            "Extracted {}: {} questions, {} diagrams, {} answers merged, {} errors",
            name,
            questions_extracted,
            diagrams_extracted,
            answers.merged,
            metrics.errors.len()
        );
        if let Some(ref cb) = cb {
            cb.on_document_complete(&name, questions_extracted, metrics.errors.len());
        }

        Ok(ExamPaper {
            metadata,
            questions: forest,
            answer_keys: answers.answers.values().cloned().collect(),
            metrics,
        })
    }
}

fn advance(document: &str, state: &mut RunState, next: RunState) {
    info!("{}: {} → {}", document, state, next);
    *state = next;
}
