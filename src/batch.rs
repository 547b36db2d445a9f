//! Concurrent multi-document extraction with per-document isolation.
//!
//! One tokio task per document, at most `max_concurrent` running at once
//! (a [`Semaphore`] permit is held for the task's lifetime). A fatal error,
//! a deadline or even a panic in one document becomes that document's
//! [`DocumentOutcome`]; siblings are never cancelled. Outcomes come back in
//! input order.

use crate::error::ExtractionError;
use crate::ledger::UsageLedger;
use crate::model::{ExamPaper, ExtractionMetrics};
use crate::orchestrator::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Result of one document in a batch.
#[derive(Debug)]
pub struct DocumentOutcome {
    pub document: String,
    pub result: Result<ExamPaper, ExtractionError>,
    /// Final ledger snapshot, for failed documents too.
    pub metrics: ExtractionMetrics,
}

impl DocumentOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct BatchRunner {
    orchestrator: Orchestrator,
    max_concurrent: usize,
    document_timeout: Option<Duration>,
}

impl BatchRunner {
    /// Limits come from the orchestrator's config
    /// (`max_concurrent_documents`, `document_timeout_secs`).
    pub fn new(orchestrator: Orchestrator) -> Self {
        let config = orchestrator.config();
        let max_concurrent = config.max_concurrent_documents.max(1);
        let document_timeout = config.document_timeout_secs.map(Duration::from_secs);
        Self {
            orchestrator,
            max_concurrent,
            document_timeout,
        }
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn document_timeout(mut self, timeout: Duration) -> Self {
        self.document_timeout = Some(timeout);
        self
    }

    /// Extract every document; never fails as a whole.
    pub async fn run(&self, documents: Vec<String>) -> Vec<DocumentOutcome> {
        let total = documents.len();
        info!(
            "Batch of {} documents, {} at a time",
            total, self.max_concurrent
        );
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(total);

        for document in documents {
            let semaphore = Arc::clone(&semaphore);
            let orchestrator = self.orchestrator.clone();
            let timeout = self.document_timeout;
            let ledger = Arc::new(UsageLedger::new(orchestrator.config().rates.clone()));
            let task_ledger = Arc::clone(&ledger);
            let task_document = document.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return Err(ExtractionError::Internal(format!("batch semaphore closed: {e}")));
                    }
                };
                let run = orchestrator.run_with_ledger(&task_document, task_ledger);
                match timeout {
                    None => run.await,
                    Some(limit) => match tokio::time::timeout(limit, run).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!("{} exceeded its {:?} deadline", task_document, limit);
                            Err(ExtractionError::DocumentTimeout {
                                document: task_document.clone(),
                                secs: limit.as_secs(),
                            })
                        }
                    },
                }
            });
            handles.push((document, ledger, handle));
        }

        let mut outcomes = Vec::with_capacity(total);
        for (document, ledger, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Extraction task for {} failed: {}", document, e);
                    Err(ExtractionError::TaskFailed {
                        document: document.clone(),
                        detail: e.to_string(),
                    })
                }
            };
            if let Err(ref e) = result {
                warn!("{} failed: {}", document, e);
            }
            // The guard inside the run finalises on every exit path; this
            // covers a task that died before the run started.
            let metrics = ledger.end_run();
            outcomes.push(DocumentOutcome {
                document,
                result,
                metrics,
            });
        }

        let ok = outcomes.iter().filter(|o| o.is_success()).count();
        info!("Batch complete: {}/{} documents succeeded", ok, total);
        outcomes
    }
}
