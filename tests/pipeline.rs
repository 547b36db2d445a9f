//! Pipeline integration tests.
//!
//! Every collaborator is faked: pages are blank 1000×1000 rasters with a
//! caller-supplied text layer, and the vision model replies from a table
//! keyed by `(task, page)`. No pdfium, no network, no API key.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use edgequake_exam2json::{
    BatchRunner, DiagramImage, DocumentSource, ExtractionConfig, ExtractionError, InlineCropper, Orchestrator,
    PageContent, Phase, ResponseConfig, TokenUsage, UsageLedger, VisionError, VisionModel, VisionReply,
    VisionRequest, VisionTask,
};
use image::DynamicImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Serves fixed page texts per document name; unknown documents fail to parse.
#[derive(Default)]
struct FakeSource {
    documents: HashMap<String, Vec<String>>,
}

impl FakeSource {
    fn with(mut self, name: &str, pages: &[&str]) -> Self {
        self.documents
            .insert(name.to_string(), pages.iter().map(|p| p.to_string()).collect());
        self
    }
}

#[async_trait]
impl DocumentSource for FakeSource {
    async fn parse(&self, document: &str) -> Result<Vec<PageContent>, ExtractionError> {
        let texts = self
            .documents
            .get(document)
            .ok_or_else(|| ExtractionError::CorruptPdf {
                path: document.into(),
                detail: "unreadable xref table".into(),
            })?;
        Ok(texts
            .iter()
            .enumerate()
            .map(|(i, text)| PageContent::new(i, text.clone(), DynamicImage::new_rgb8(1000, 1000)))
            .collect())
    }
}

const CALL_USAGE: TokenUsage = TokenUsage {
    input_tokens: 100,
    output_tokens: 50,
};

/// Canned replies per `(task, page_index)`. Question extraction on a page
/// without a reply returns no questions; anything else unanswered fails.
#[derive(Default)]
struct FakeVision {
    replies: HashMap<(VisionTask, usize), Result<String, VisionError>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeVision {
    fn reply(mut self, task: VisionTask, page: usize, text: &str) -> Self {
        self.replies.insert((task, page), Ok(text.to_string()));
        self
    }

    fn fail(mut self, task: VisionTask, page: usize, usage: Option<TokenUsage>) -> Self {
        self.replies.insert(
            (task, page),
            Err(VisionError::CallFailed {
                message: "503 Service Unavailable".into(),
                usage,
            }),
        );
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl VisionModel for FakeVision {
    fn model_name(&self) -> &str {
        "fake-vision"
    }

    async fn generate(&self, request: &VisionRequest) -> Result<VisionReply, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = match self.replies.get(&(request.task, request.page_index)) {
            Some(reply) => reply.clone()?,
            None if request.task == VisionTask::QuestionExtraction => r#"{"questions": []}"#.to_string(),
            None => {
                return Err(VisionError::CallFailed {
                    message: format!("no canned reply for {:?} on page {}", request.task, request.page_index),
                    usage: None,
                })
            }
        };
        Ok(VisionReply { text, usage: CALL_USAGE })
    }
}

fn orchestrator(source: FakeSource, vision: Arc<FakeVision>, config: ExtractionConfig) -> Orchestrator {
    Orchestrator::new(config, Arc::new(source), vision, Arc::new(InlineCropper))
}

fn default_config() -> ExtractionConfig {
    ExtractionConfig::builder().concurrency(2).build().unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_page_is_recorded_and_the_rest_survives() {
    let source = FakeSource::default().with(
        "2023_P6_Maths_SA2_Nanyang_Primary.pdf",
        &["Section A\n1. Study the figure.", "Section B\n2. Find the area."],
    );
    let vision = Arc::new(
        FakeVision::default()
            .reply(
                VisionTask::QuestionExtraction,
                0,
                r#"```json
{"questions": [{
  "question_number": 1,
  "question_text": "Study the figure below.",
  "marks": "[2 marks]",
  "position": "top",
  "diagrams": [{"diagram_description": "triangle ABC", "diagram_type": "geometry",
                "bounding_box": {"x_min": 50, "y_min": 200, "x_max": 300, "y_max": 400}}]
}]}
```"#,
            )
            .fail(VisionTask::QuestionExtraction, 1, Some(TokenUsage::new(10, 0))),
    );
    let orch = orchestrator(source, Arc::clone(&vision), default_config());

    let paper = orch.run("2023_P6_Maths_SA2_Nanyang_Primary.pdf").await.unwrap();

    assert_eq!(paper.questions.len(), 1);
    let q1 = &paper.questions[0];
    assert_eq!(q1.question_number, "1");
    assert_eq!(q1.marks, Some(2.0));
    assert_eq!(q1.diagrams.len(), 1);
    let d = &q1.diagrams[0];
    assert_eq!((d.rect.x_min, d.rect.y_min, d.rect.x_max, d.rect.y_max), (5.0, 20.0, 30.0, 40.0));
    assert!(matches!(d.image, DiagramImage::Inline { .. }));

    let m = &paper.metrics;
    assert_eq!(m.errors.len(), 1);
    // Issue pages are 1-indexed; the failing page has index 1.
    assert_eq!(m.errors[0].page, Some(2));
    assert_eq!(m.errors[0].phase, Phase::Questions);
    assert_eq!(m.pages_processed, 2);
    assert_eq!(m.questions_extracted, 1);
    assert_eq!(m.diagrams_extracted, 1);
    // One successful call plus the usage the failed call reported.
    assert_eq!(m.input_tokens, 110);
    assert_eq!(m.output_tokens, 50);
    assert!(m.finished_at.is_some());

    assert_eq!(paper.metadata.year, Some(2023));
    assert_eq!(paper.metadata.grade_level.as_deref(), Some("P6"));
    assert_eq!(paper.metadata.exam_type.as_deref(), Some("SA2"));
}

#[tokio::test]
async fn answer_page_marks_the_correct_option() {
    let source = FakeSource::default().with(
        "quiz.pdf",
        &["7. Which number is the largest?", "ANSWER KEY\n7. B"],
    );
    let vision = Arc::new(
        FakeVision::default()
            .reply(
                VisionTask::QuestionExtraction,
                0,
                r#"{"questions": [{"question_number": "7", "question_text": "Which number is the largest?",
                   "response_type": "MCQ",
                   "options": ["(A) 60 340", "(B) 63 040", "(C) 60 430", "(D) 63 004"]}]}"#,
            )
            .reply(
                VisionTask::AnswerExtraction,
                1,
                r#"{"answers": [{"question_ref": "7", "final_answer": "B"},
                                {"question_ref": "8", "final_answer": "12 cm"}]}"#,
            ),
    );
    let orch = orchestrator(source, vision, default_config());

    let paper = orch.run("quiz.pdf").await.unwrap();

    let q7 = &paper.questions[0];
    assert_eq!(q7.answer_key.as_ref().map(|k| k.final_answer.as_str()), Some("B"));
    let Some(ResponseConfig::MultipleChoice { options }) = &q7.response_config else {
        panic!("expected MCQ config, got {:?}", q7.response_config);
    };
    let correct: Vec<&str> = options
        .iter()
        .filter(|o| o.is_correct)
        .map(|o| o.label.as_str())
        .collect();
    assert_eq!(correct, ["B"]);

    // Keys without a question stay on the paper, unmerged.
    assert_eq!(paper.answer_keys.len(), 2);
    assert_eq!(paper.metrics.answers_merged, 1);
    assert!(paper.metrics.errors.is_empty());
}

#[tokio::test]
async fn questions_read_off_the_answer_page_are_dropped() {
    let source = FakeSource::default().with(
        "quiz.pdf",
        &["7. Which number is the largest?", "ANSWER KEY\n7. B"],
    );
    let vision = Arc::new(
        FakeVision::default()
            .reply(
                VisionTask::QuestionExtraction,
                0,
                r#"{"questions": [{"question_number": "7", "question_text": "Which number is the largest?",
                   "options": ["(A) 60 340", "(B) 63 040", "(C) 60 430", "(D) 63 004"]}]}"#,
            )
            .reply(
                VisionTask::QuestionExtraction,
                1,
                r#"{"questions": [{"question_number": "7", "question_text": "B"}]}"#,
            )
            .reply(
                VisionTask::AnswerExtraction,
                1,
                r#"{"answers": [{"question_ref": "7", "final_answer": "B"}]}"#,
            ),
    );
    let orch = orchestrator(source, vision, default_config());

    let paper = orch.run("quiz.pdf").await.unwrap();

    assert_eq!(paper.questions.len(), 1);
    assert_eq!(paper.questions[0].source.page_index, 0);
    assert!(paper.questions[0].answer_key.is_some());
    assert_eq!(paper.metrics.answers_merged, 1);
    assert_eq!(paper.metrics.questions_extracted, 1);
    assert!(paper.metrics.errors.is_empty());
    assert_eq!(paper.metrics.warnings.len(), 1);
    assert!(paper.metrics.warnings[0].message.contains("answer pages [2]"));
}

#[tokio::test]
async fn diagram_referenced_from_two_pages_is_shared() {
    let source = FakeSource::default().with("science.pdf", &["3. Look at the set-up.", "4. Continue."]);
    let vision = Arc::new(
        FakeVision::default()
            .reply(
                VisionTask::QuestionExtraction,
                0,
                r#"{"questions": [{"question_number": "3", "question_text": "Look at the set-up.",
                     "subparts": [{"part_label": "a", "question_text": "Name part X."}]}],
                   "diagrams": [{"diagram_description": "beaker", "associated_question": "3a",
                                 "bounding_box": [100, 100, 400, 400]}]}"#,
            )
            .reply(
                VisionTask::QuestionExtraction,
                1,
                r#"{"questions": [{"question_number": "4", "question_text": "Continue."}],
                   "diagrams": [{"diagram_description": "beaker, heated", "associated_question": "3(a)",
                                 "bounding_box": [100, 500, 400, 800]}]}"#,
            ),
    );
    let config = ExtractionConfig::builder().extract_answers(false).build().unwrap();
    let orch = orchestrator(source, vision, config);

    let paper = orch.run("science.pdf").await.unwrap();

    let q3a = &paper.questions[0].subparts[0];
    assert_eq!(q3a.question_number, "3(a)");
    assert_eq!(q3a.diagrams.len(), 2);
    assert!(q3a.diagrams.iter().all(|d| d.is_shared));
    let pages: Vec<usize> = q3a.diagrams.iter().map(|d| d.source_page).collect();
    assert_eq!(pages, [0, 1]);

    // The page-2 diagram is also on the question printed next to it.
    let q4 = &paper.questions[1];
    assert_eq!(q4.diagrams.len(), 1);
    assert_eq!(q4.diagrams[0].id, q3a.diagrams[1].id);
    assert_eq!(paper.metrics.diagrams_extracted, 2);
}

#[test]
fn parse_failure_is_fatal_and_finalizes_the_ledger() {
    let vision = Arc::new(FakeVision::default());
    let orch = orchestrator(FakeSource::default(), Arc::clone(&vision), default_config());
    let ledger = Arc::new(UsageLedger::default());

    let result = tokio_test::block_on(orch.run_with_ledger("missing.pdf", Arc::clone(&ledger)));

    assert!(matches!(result, Err(ExtractionError::CorruptPdf { .. })));
    assert!(ledger.is_finalized());
    let metrics = ledger.snapshot();
    assert_eq!(metrics.errors.len(), 1);
    assert_eq!(metrics.errors[0].phase, Phase::Parse);
    assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn answers_phase_failure_is_not_fatal() {
    let source = FakeSource::default().with("p.pdf", &["1. Add.", "Answers\n1. 4"]);
    let vision = Arc::new(
        FakeVision::default()
            .reply(VisionTask::QuestionExtraction, 0, r#"[{"question_number": "1", "question_text": "2 + 2"}]"#)
            .reply(VisionTask::AnswerExtraction, 1, "Sorry, I cannot read this page."),
    );
    let orch = orchestrator(source, vision, default_config());

    let paper = orch.run("p.pdf").await.unwrap();

    assert_eq!(paper.questions.len(), 1);
    assert!(paper.questions[0].answer_key.is_none());
    assert_eq!(paper.metrics.errors.len(), 1);
    assert_eq!(paper.metrics.errors[0].phase, Phase::Answers);
}

// ── Batch ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_isolates_failing_documents() {
    let source = FakeSource::default().with("good.pdf", &["1. Add."]);
    let vision = Arc::new(FakeVision::default().reply(
        VisionTask::QuestionExtraction,
        0,
        r#"{"questions": [{"question_number": "1", "question_text": "2 + 2"}]}"#,
    ));
    let runner = BatchRunner::new(orchestrator(source, vision, default_config())).max_concurrent(2);

    let outcomes = runner
        .run(vec!["broken.pdf".into(), "good.pdf".into(), "also-broken.pdf".into()])
        .await;

    let names: Vec<&str> = outcomes.iter().map(|o| o.document.as_str()).collect();
    assert_eq!(names, ["broken.pdf", "good.pdf", "also-broken.pdf"]);
    assert!(!outcomes[0].is_success());
    assert!(outcomes[1].is_success());
    assert!(!outcomes[2].is_success());
    assert_eq!(outcomes[0].metrics.errors.len(), 1);
    assert_eq!(outcomes[1].metrics.questions_extracted, 1);
    assert!(outcomes.iter().all(|o| o.metrics.finished_at.is_some()));
}

#[tokio::test]
async fn batch_deadline_abandons_slow_document() {
    let source = FakeSource::default().with("slow.pdf", &["1. Add."]);
    let vision = Arc::new(FakeVision::default().slow(Duration::from_secs(30)));
    let runner = BatchRunner::new(orchestrator(source, vision, default_config()))
        .document_timeout(Duration::from_millis(50));

    let outcomes = runner.run(vec!["slow.pdf".into()]).await;

    assert!(matches!(
        outcomes[0].result,
        Err(ExtractionError::DocumentTimeout { .. })
    ));
    assert!(outcomes[0].metrics.finished_at.is_some());
}

// ── Cancellation and accounting ──────────────────────────────────────────────

#[tokio::test]
async fn cancelled_run_still_finalizes_the_ledger() {
    let source = FakeSource::default().with("slow.pdf", &["1. Add.", "2. Subtract."]);
    let vision = Arc::new(FakeVision::default().slow(Duration::from_secs(30)));
    let orch = orchestrator(source, Arc::clone(&vision), default_config());
    let ledger = Arc::new(UsageLedger::default());

    let task_ledger = Arc::clone(&ledger);
    let handle = tokio::spawn(async move { orch.run_with_ledger("slow.pdf", task_ledger).await });
    while vision.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!ledger.is_finalized());

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert!(ledger.is_finalized());
    assert_eq!(ledger.snapshot().input_tokens, 0);
}

#[tokio::test]
async fn concurrent_pages_sum_exactly() {
    let pages: Vec<String> = (1..=12).map(|n| format!("{n}. Solve.")).collect();
    let page_refs: Vec<&str> = pages.iter().map(String::as_str).collect();
    let source = FakeSource::default().with("long.pdf", &page_refs);
    let vision = Arc::new(FakeVision::default());
    let config = ExtractionConfig::builder()
        .concurrency(6)
        .extract_answers(false)
        .build()
        .unwrap();
    let orch = orchestrator(source, Arc::clone(&vision), config);

    let paper = orch.run("long.pdf").await.unwrap();

    assert_eq!(vision.calls.load(Ordering::SeqCst), 12);
    assert_eq!(paper.metrics.input_tokens, 12 * 100);
    assert_eq!(paper.metrics.output_tokens, 12 * 50);
    assert_eq!(paper.metrics.total_tokens, 12 * 150);
    let usage = paper
        .metrics
        .usage_by_agent
        .iter()
        .find(|a| a.agent == "question_extractor")
        .unwrap();
    assert_eq!(usage.calls, 12);
}
