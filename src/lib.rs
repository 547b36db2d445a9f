//! # edgequake-exam2json
//!
//! Extract scanned exam papers into structured JSON (questions, subparts,
//! diagrams and answer keys) using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Exam papers mix numbered questions, nested subparts, multiple-choice
//! options, diagrams and, at the back, an answer key. Text extraction loses
//! the structure and OCR loses the figures. This crate shows every page to a
//! VLM once, asks for questions and diagram boxes together, then does the
//! rest (cropping, linking diagrams to questions, matching answers to
//! questions) locally without further model calls.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Parse      pages + text layer via pdfium (spawn_blocking)      fatal on failure
//!  ├─ 2. Metadata   subject / grade / year / exam type from the name    pure
//!  ├─ 3. Questions  one VLM call per page, concurrent                   per-page errors
//!  ├─ 3b. Diagrams  crop + link descriptors to questions, no VLM        per-diagram errors
//!  ├─ 4. Answers    detect answer pages, extract, merge by question no. skippable
//!  └─ 5. Finalize   counts + usage ledger → ExamPaper
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_exam2json::{ExtractionConfig, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let orchestrator = Orchestrator::from_config(ExtractionConfig::default())?;
//!     let paper = orchestrator.run("2023_P6_Maths_SA2.pdf").await?;
//!     println!("{}", serde_json::to_string_pretty(&paper)?);
//!     eprintln!("cost: ${:.4}, errors: {}",
//!         paper.metrics.total_cost_usd,
//!         paper.metrics.errors.len());
//!     Ok(())
//! }
//! ```
//!
//! Several papers at once, with per-document isolation:
//!
//! ```rust,no_run
//! use edgequake_exam2json::{BatchRunner, ExtractionConfig, Orchestrator};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExtractionConfig::builder().max_concurrent_documents(3).build()?;
//! let runner = BatchRunner::new(Orchestrator::from_config(config)?);
//! for outcome in runner.run(vec!["a.pdf".into(), "b.pdf".into()]).await {
//!     match outcome.result {
//!         Ok(paper) => println!("{}: {} questions", outcome.document, paper.all_questions().len()),
//!         Err(e) => eprintln!("{}: {}", outcome.document, e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exam2json` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-exam2json = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod geometry;
pub mod identifier;
pub mod ledger;
pub mod linker;
pub mod merger;
pub mod model;
pub mod orchestrator;
pub mod phases;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{BatchRunner, DocumentOutcome};
pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use error::{CropError, DecodeError, ExtractionError, PageError, VisionError};
pub use geometry::{to_pixel_rect, to_storage_scale, Band, PixelRect, Rect, Scale};
pub use identifier::{normalize, same_question};
pub use ledger::{LedgerGuard, RateTable, RunCounts, TokenUsage, UsageLedger};
pub use linker::{mark_cross_page_sharing, DiagramLinker, QuestionIndex};
pub use merger::{merge_answers, AnswerMap, MergeOutcome};
pub use model::{
    AnswerKey, Diagram, DiagramDescriptor, DiagramImage, DiagramType, ExamMetadata, ExamPaper, ExtractionMetrics,
    McqOption, PageContent, Phase, Question, ResponseConfig, ResponseType, Subject,
};
pub use orchestrator::{Orchestrator, RunState};
pub use pipeline::crop::{CropKey, Cropper, FileCropper, InlineCropper};
pub use pipeline::render::{DocumentSource, PdfiumSource};
pub use pipeline::vision::{EdgequakeVision, VisionModel, VisionReply, VisionRequest, VisionTask};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
