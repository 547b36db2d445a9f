//! Progress-callback trait for document, phase and page events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to observe a
//! run as it happens: the CLI renders a progress bar from it, a server could
//! forward the events to a websocket.
//!
//! # Example
//!
//! ```rust
//! use edgequake_exam2json::{ExtractionConfig, ExtractionProgressCallback, Phase};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl ExtractionProgressCallback for PageCounter {
//!     fn on_page_complete(&self, _doc: &str, phase: Phase, _page: usize, _total: usize) {
//!         if phase == Phase::Questions {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(PageCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::model::Phase;
use std::sync::Arc;

/// Called by the orchestrator as a document moves through the pipeline.
///
/// Implementations must be `Send + Sync`: page events fire concurrently from
/// the fan-out inside a phase, and in batch mode several documents report at
/// once. Every method has a no-op default.
///
/// `document` is the name the paper was submitted under; `page_num` is
/// 1-indexed.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once the document is parsed and its page count is known.
    fn on_document_start(&self, document: &str, total_pages: usize) {
        let _ = (document, total_pages);
    }

    /// Called when a phase begins.
    fn on_phase_start(&self, document: &str, phase: Phase) {
        let _ = (document, phase);
    }

    /// Called when a page finishes a phase successfully.
    fn on_page_complete(&self, document: &str, phase: Phase, page_num: usize, total_pages: usize) {
        let _ = (document, phase, page_num, total_pages);
    }

    /// Called when a page fails a phase (non-fatal).
    fn on_page_error(
        &self,
        document: &str,
        phase: Phase,
        page_num: usize,
        total_pages: usize,
        error: &str,
    ) {
        let _ = (document, phase, page_num, total_pages, error);
    }

    /// Called after the paper is assembled.
    fn on_document_complete(&self, document: &str, questions: usize, errors: usize) {
        let _ = (document, questions, errors);
    }

    /// Called when the document fails fatally.
    fn on_document_failed(&self, document: &str, error: &str) {
        let _ = (document, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        phases: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ExtractionProgressCallback for Tracking {
        fn on_phase_start(&self, _document: &str, _phase: Phase) {
            self.phases.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _d: &str, _p: Phase, _n: usize, _t: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _d: &str, _p: Phase, _n: usize, _t: usize, _e: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_document_start("a.pdf", 3);
        cb.on_phase_start("a.pdf", Phase::Questions);
        cb.on_page_complete("a.pdf", Phase::Questions, 1, 3);
        cb.on_page_error("a.pdf", Phase::Questions, 2, 3, "timeout");
        cb.on_document_complete("a.pdf", 12, 1);
        cb.on_document_failed("b.pdf", "not a pdf");
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = Arc::new(Tracking::default());
        let cb: ProgressCallback = tracker.clone();
        cb.on_phase_start("a.pdf", Phase::Questions);
        cb.on_page_complete("a.pdf", Phase::Questions, 1, 2);
        cb.on_page_error("a.pdf", Phase::Questions, 2, 2, "bad json");
        cb.on_phase_start("a.pdf", Phase::Answers);

        assert_eq!(tracker.phases.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
