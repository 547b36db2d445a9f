//! Phase 4: find answer-key pages, extract their answers, merge once.
//!
//! Detection is a header keyword check first. Pages it does not flag can
//! optionally be sent to the model for classification; a failed
//! classification counts as "question page". Answer pages are then
//! extracted concurrently and folded into one [`AnswerMap`] in page order,
//! so the last answer page wins for a repeated number.
//!
//! Questions the extractor read off answer pages are the key's own
//! numbering, not questions of the paper: they are removed from the forest
//! before the merge, and the removal is recorded as a warning. Nothing here
//! can fail the run: the worst case is an empty map and zero merges.

use super::{PhaseContext, ANSWER_EXTRACTOR, ANSWER_MERGER, PAGE_CLASSIFIER};
use crate::error::PageError;
use crate::merger::{merge_answers, AnswerMap};
use crate::model::{AnswerKey, PageContent, Phase, Question};
use crate::pipeline::schema::{self, AnswerSheet, PageClassification};
use crate::pipeline::vision::{VisionRequest, VisionTask};
use crate::prompts;
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

/// Header lines (alphanumerics only, lower-cased) that mark an answer page.
const ANSWER_HEADERS: &[&str] = &[
    "answerkey",
    "answerkeys",
    "answersheet",
    "answers",
    "markingscheme",
    "markscheme",
    "solutions",
    "workedsolutions",
    "suggestedanswers",
];

/// How many leading non-empty lines count as the page header.
const HEADER_LINES: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct AnswersOutcome {
    /// 0-based indices of pages classified as answer pages.
    pub answer_pages: Vec<usize>,
    pub answers: AnswerMap,
    /// Question nodes that received a key.
    pub merged: usize,
    /// Top-level questions removed because they came from answer pages.
    pub dropped_questions: usize,
}

/// Keyword check on the page's first lines.
pub fn looks_like_answer_page(text: &str) -> bool {
    text.lines()
        .map(|l| {
            l.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|l| !l.is_empty())
        .take(HEADER_LINES)
        .any(|l| ANSWER_HEADERS.iter().any(|h| l.starts_with(h)))
}

pub async fn run(ctx: &PhaseContext, pages: &[PageContent], forest: &mut Vec<Question>) -> AnswersOutcome {
    ctx.ledger.record_agent(PAGE_CLASSIFIER);
    let total = pages.len();

    let mut answer_pages: Vec<usize> = stream::iter(pages.iter().map(|page| async move {
        if looks_like_answer_page(&page.text) {
            debug!("Page {} flagged as answer page by header", page.number());
            return Some(page.index);
        }
        if !ctx.config.model_page_classification {
            return None;
        }
        match classify_page(ctx, page).await {
            Ok(true) => Some(page.index),
            Ok(false) => None,
            Err(e) => {
                ctx.page_failed(PAGE_CLASSIFIER, Phase::Answers, &e, total);
                None
            }
        }
    }).collect::<Vec<_>>())
    .buffer_unordered(ctx.config.concurrency.max(1))
    .filter_map(|idx| async move { idx })
    .collect()
    .await;
    answer_pages.sort_unstable();

    if answer_pages.is_empty() {
        info!("No answer pages found");
        return AnswersOutcome::default();
    }
    info!("{} answer pages: {:?}", answer_pages.len(), answer_pages);
    let dropped_questions = drop_answer_page_questions(forest, &answer_pages);
    if dropped_questions > 0 {
        let numbers: Vec<usize> = answer_pages.iter().map(|i| i + 1).collect();
        ctx.ledger.log_warning(
            PAGE_CLASSIFIER,
            Phase::Answers,
            None,
            format!("removed {dropped_questions} questions read from answer pages {numbers:?}"),
        );
    }

    let mut extracted: Vec<(usize, Vec<AnswerKey>)> = stream::iter(
        pages
            .iter()
            .filter(|p| answer_pages.contains(&p.index))
            .map(|page| async move {
                match extract_answers(ctx, page).await {
                    Ok(keys) => {
                        ctx.page_done(Phase::Answers, page.number(), total);
                        (page.index, keys)
                    }
                    Err(e) => {
                        ctx.page_failed(ANSWER_EXTRACTOR, Phase::Answers, &e, total);
                        (page.index, Vec::new())
                    }
                }
            })
            .collect::<Vec<_>>(),
    )
    .buffer_unordered(ctx.config.concurrency.max(1))
    .collect()
    .await;
    extracted.sort_by_key(|(idx, _)| *idx);

    let answers: AnswerMap = extracted.into_iter().flat_map(|(_, keys)| keys).collect();

    ctx.ledger.record_agent(ANSWER_MERGER);
    let outcome = merge_answers(forest, &answers);
    for w in &outcome.warnings {
        ctx.ledger.log_warning(
            ANSWER_MERGER,
            Phase::Answers,
            None,
            format!("question {}: {}", w.question_number, w.message),
        );
    }
    info!("Merged {} of {} answer keys", outcome.merged, answers.len());

    AnswersOutcome {
        answer_pages,
        answers,
        merged: outcome.merged,
        dropped_questions,
    }
}

/// Remove top-level questions (with their subparts) extracted from
/// `answer_pages`. Returns how many were removed.
pub fn drop_answer_page_questions(forest: &mut Vec<Question>, answer_pages: &[usize]) -> usize {
    let before = forest.len();
    forest.retain(|q| !answer_pages.contains(&q.source.page_index));
    before - forest.len()
}

async fn classify_page(ctx: &PhaseContext, page: &PageContent) -> Result<bool, PageError> {
    let request = VisionRequest {
        task: VisionTask::PageClassification,
        page_index: page.index,
        system: prompts::SYSTEM_PROMPT.to_string(),
        prompt: prompts::page_classification_request(page.number()),
        image: Some(page.image.clone()),
    };
    let failure = |page: usize, detail: String| PageError::ClassificationFailed { page, detail };
    let text = ctx
        .call_model(PAGE_CLASSIFIER, &request)
        .await
        .map_err(|e| PageError::from_vision(page.number(), &e, failure))?;
    let parsed: PageClassification = schema::decode(&text).map_err(|e| failure(page.number(), e.to_string()))?;
    debug!("Page {} classified as {:?}", page.number(), parsed.page_type);
    Ok(parsed.is_answer_page())
}

async fn extract_answers(ctx: &PhaseContext, page: &PageContent) -> Result<Vec<AnswerKey>, PageError> {
    let request = VisionRequest {
        task: VisionTask::AnswerExtraction,
        page_index: page.index,
        system: prompts::SYSTEM_PROMPT.to_string(),
        prompt: prompts::answer_extraction_request(page.number(), &page.text),
        image: Some(page.image.clone()),
    };
    let text = ctx
        .call_model(ANSWER_EXTRACTOR, &request)
        .await
        .map_err(|e| {
            PageError::from_vision(page.number(), &e, |page, detail| PageError::AnswerExtractionFailed {
                page,
                detail,
            })
        })?;
    let sheet: AnswerSheet = schema::decode(&text).map_err(|e| PageError::MalformedResponse {
        page: page.number(),
        detail: e.to_string(),
    })?;
    let keys = sheet.into_keys();
    debug!("Page {}: {} answers", page.number(), keys.len());
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Band;
    use crate::model::{QuestionContent, QuestionSource, ResponseType};

    fn question(number: &str, page_index: usize) -> Question {
        Question {
            id: format!("p{page_index}-q{number}"),
            question_number: number.into(),
            parent_id: None,
            content: QuestionContent::default(),
            response_type: ResponseType::ShortAnswer,
            response_config: None,
            marks: None,
            diagrams: vec![],
            answer_key: None,
            subparts: vec![],
            depth: 0,
            source: QuestionSource { page_index, band: Band::Top },
            confidence: 0.8,
        }
    }

    #[test]
    fn answer_page_questions_are_removed() {
        let mut forest = vec![question("7", 0), question("8", 1), question("7", 2), question("8", 2)];
        assert_eq!(drop_answer_page_questions(&mut forest, &[2]), 2);
        let kept: Vec<&str> = forest.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(kept, ["p0-q7", "p1-q8"]);
        assert_eq!(drop_answer_page_questions(&mut forest, &[]), 0);
    }

    #[test]
    fn header_keywords() {
        assert!(looks_like_answer_page("ANSWER KEY\n1. B\n2. C"));
        assert!(looks_like_answer_page("\n\n  Marking Scheme  \nSection A"));
        assert!(looks_like_answer_page("Nanyang Primary\nP6 Maths SA2\nAnswers"));
        assert!(!looks_like_answer_page("1. Write your answers in the boxes.\n2. Show your working."));
        assert!(!looks_like_answer_page(""));
    }
}
