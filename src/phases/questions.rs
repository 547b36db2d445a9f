//! Phase 3: combined question + diagram extraction, one model call per page.
//!
//! Pages run concurrently (bounded by `config.concurrency`) and come back in
//! page order. A page whose call fails or whose reply does not decode is
//! recorded in the ledger and contributes no questions and no descriptors.
//!
//! Subpart trees are built here, once, from the nesting of the reply. A
//! subpart without its own number takes `{parent}({part_label})`, and a
//! bare letter like `"b"` is prefixed with the parent number, so `7(b)`
//! is what the linker and the merger see.

use super::{PhaseContext, QUESTION_EXTRACTOR};
use crate::error::PageError;
use crate::geometry::{Band, Scale};
use crate::model::{
    DiagramDescriptor, DiagramType, MatchingPair, McqOption, PageContent, Phase, Question, QuestionContent,
    QuestionSource, ResponseConfig, ResponseType,
};
use crate::pipeline::schema::{self, PageExtraction, RawDiagram, RawQuestion};
use crate::pipeline::vision::{VisionRequest, VisionTask};
use crate::prompts;
use futures::stream::{self, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

/// Confidence given to a question whose reply carried none.
const DEFAULT_QUESTION_CONFIDENCE: f64 = 0.8;

/// One page's extraction result.
#[derive(Debug, Clone, Default)]
pub struct PageQuestions {
    /// 0-based page index.
    pub page_index: usize,
    pub questions: Vec<Question>,
    pub descriptors: Vec<DiagramDescriptor>,
}

/// Extract questions and diagram descriptors from every page.
pub async fn run(ctx: &PhaseContext, pages: &[PageContent]) -> Vec<PageQuestions> {
    let total = pages.len();
    let mut results: Vec<PageQuestions> = stream::iter(pages.iter().map(|page| async move {
        match extract_page(ctx, page).await {
            Ok(result) => {
                ctx.page_done(Phase::Questions, page.number(), total);
                result
            }
            Err(e) => {
                ctx.page_failed(QUESTION_EXTRACTOR, Phase::Questions, &e, total);
                PageQuestions {
                    page_index: page.index,
                    ..Default::default()
                }
            }
        }
    }).collect::<Vec<_>>())
    .buffer_unordered(ctx.config.concurrency.max(1))
    .collect()
    .await;

    results.sort_by_key(|r| r.page_index);
    let count: usize = results
        .iter()
        .flat_map(|r| r.questions.iter())
        .map(Question::node_count)
        .sum();
    info!("Extracted {} questions from {} pages", count, total);
    results
}

async fn extract_page(ctx: &PhaseContext, page: &PageContent) -> Result<PageQuestions, PageError> {
    let request = VisionRequest {
        task: VisionTask::QuestionExtraction,
        page_index: page.index,
        system: prompts::SYSTEM_PROMPT.to_string(),
        prompt: prompts::question_extraction_request(page.number(), &page.text),
        image: Some(page.image.clone()),
    };

    let text = ctx
        .call_model(QUESTION_EXTRACTOR, &request)
        .await
        .map_err(|e| {
            PageError::from_vision(page.number(), &e, |page, detail| PageError::ExtractionFailed {
                page,
                detail,
            })
        })?;

    let parsed: PageExtraction = schema::decode(&text).map_err(|e| PageError::MalformedResponse {
        page: page.number(),
        detail: e.to_string(),
    })?;

    let (raw_questions, raw_diagrams) = parsed.into_parts();
    let result = build_page(page.index, raw_questions, raw_diagrams);
    debug!(
        "Page {}: {} questions, {} diagram descriptors",
        page.number(),
        result.questions.len(),
        result.descriptors.len()
    );
    Ok(result)
}

/// Build the question forest and descriptor list for one page.
pub fn build_page(page_index: usize, raw_questions: Vec<RawQuestion>, raw_diagrams: Vec<RawDiagram>) -> PageQuestions {
    let mut descriptors = Vec::new();
    let count = raw_questions.len();
    let questions = raw_questions
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let band = raw
                .position
                .as_deref()
                .and_then(Band::parse)
                .unwrap_or_else(|| Band::from_order(i, count));
            build_node(raw, None, 0, band, page_index, &mut descriptors)
        })
        .collect();

    descriptors.extend(
        raw_diagrams
            .into_iter()
            .map(|d| descriptor(d, String::new(), page_index)),
    );

    PageQuestions {
        page_index,
        questions,
        descriptors,
    }
}

fn build_node(
    raw: RawQuestion,
    parent: Option<(&str, &str)>,
    depth: u32,
    band: Band,
    page_index: usize,
    descriptors: &mut Vec<DiagramDescriptor>,
) -> Question {
    let id = Uuid::new_v4().to_string();
    let question_number = question_number(&raw, parent.map(|(_, number)| number));

    let response_type = raw
        .response_type
        .as_deref()
        .and_then(ResponseType::parse)
        .unwrap_or(if raw.options.is_empty() {
            ResponseType::ShortAnswer
        } else {
            ResponseType::MultipleChoice
        });

    let response_config = match response_type {
        ResponseType::MultipleChoice => Some(ResponseConfig::MultipleChoice {
            options: raw
                .options
                .into_iter()
                .enumerate()
                .map(|(i, opt)| {
                    let (label, text) = opt.split(&option_label(i));
                    McqOption {
                        label,
                        text,
                        is_correct: false,
                    }
                })
                .collect(),
        }),
        ResponseType::FillBlank => Some(ResponseConfig::FillBlank { blanks: raw.blanks }),
        ResponseType::LongAnswer => Some(ResponseConfig::LongAnswer {
            word_limit: raw
                .word_limit
                .filter(|w| w.is_finite() && *w >= 1.0)
                .map(|w| w.round() as u32),
        }),
        ResponseType::WorkingArea => Some(ResponseConfig::WorkingArea { show_working: true }),
        ResponseType::TrueFalse => Some(ResponseConfig::TrueFalse),
        ResponseType::Matching => Some(ResponseConfig::Matching {
            pairs: raw
                .pairs
                .into_iter()
                .map(|p| MatchingPair {
                    left: p.left.unwrap_or_default(),
                    right: p.right.unwrap_or_default(),
                })
                .collect(),
        }),
        ResponseType::DiagramLabel => Some(ResponseConfig::DiagramLabel { labels: raw.labels }),
        ResponseType::ShortAnswer => None,
    };

    for d in raw.diagrams {
        descriptors.push(descriptor(d, question_number.clone(), page_index));
    }

    let subparts = raw
        .subparts
        .into_iter()
        .map(|sub| {
            build_node(
                sub,
                Some((id.as_str(), question_number.as_str())),
                depth + 1,
                band,
                page_index,
                descriptors,
            )
        })
        .collect();

    Question {
        parent_id: parent.map(|(pid, _)| pid.to_string()),
        content: QuestionContent {
            text: raw.question_text.unwrap_or_default(),
            text_latex: raw.question_text_latex,
            text_html: raw.question_text_html,
        },
        response_type,
        response_config,
        marks: raw.marks.filter(|m| m.is_finite() && *m >= 0.0),
        diagrams: Vec::new(),
        answer_key: None,
        subparts,
        depth,
        source: QuestionSource { page_index, band },
        confidence: raw
            .confidence
            .filter(|c| c.is_finite())
            .unwrap_or(DEFAULT_QUESTION_CONFIDENCE)
            .clamp(0.0, 1.0),
        id,
        question_number,
    }
}

fn question_number(raw: &RawQuestion, parent_number: Option<&str>) -> String {
    let parent = parent_number.unwrap_or_default();
    match (&raw.question_number, &raw.part_label) {
        (Some(n), _) if parent.is_empty() || n.chars().any(|c| c.is_ascii_digit()) => n.clone(),
        (Some(n), _) => format!("{parent}({})", strip_parens(n)),
        (None, Some(label)) if !parent.is_empty() => format!("{parent}({})", strip_parens(label)),
        (None, Some(label)) => label.clone(),
        (None, None) => String::new(),
    }
}

fn strip_parens(label: &str) -> &str {
    label.trim().trim_matches(|c| matches!(c, '(' | ')' | '.'))
}

/// `A`, `B`, … for options that came without a label.
fn option_label(i: usize) -> String {
    char::from_u32('A' as u32 + (i % 26) as u32)
        .map(String::from)
        .unwrap_or_default()
}

fn descriptor(raw: RawDiagram, default_question: String, page_index: usize) -> DiagramDescriptor {
    DiagramDescriptor {
        description: raw.diagram_description.unwrap_or_default(),
        diagram_type: raw
            .diagram_type
            .as_deref()
            .map(DiagramType::from_label)
            .unwrap_or_default(),
        rect: raw.bounding_box.as_ref().and_then(|b| b.to_rect(Scale::Inference)),
        associated_question: raw.associated_question.unwrap_or(default_question),
        source_page: page_index,
        confidence: raw.confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> PageQuestions {
        let (qs, ds) = schema::decode::<PageExtraction>(json).unwrap().into_parts();
        build_page(2, qs, ds)
    }

    #[test]
    fn nested_subparts_form_a_forest() {
        let page = parse(
            r#"{"questions": [
                {"question_number": 7, "question_text": "Study the figure.", "marks": "[4 marks]",
                 "subparts": [
                    {"part_label": "(a)", "question_text": "Find x.", "marks": 2},
                    {"question_number": "b", "question_text": "Find y.",
                     "subparts": [{"part_label": "i", "question_text": "deep"}]}
                 ]}
            ]}"#,
        );
        let q = &page.questions[0];
        assert!(q.is_well_formed());
        assert_eq!(q.question_number, "7");
        assert_eq!(q.marks, Some(4.0));
        assert_eq!(q.subparts[0].question_number, "7(a)");
        assert_eq!(q.subparts[1].question_number, "7(b)");
        assert_eq!(q.subparts[1].subparts[0].question_number, "7(b)(i)");
        assert_eq!(q.subparts[1].subparts[0].depth, 2);
        assert_eq!(q.source.page_index, 2);
    }

    #[test]
    fn mcq_options_are_split_and_labelled() {
        let page = parse(
            r#"[{"question_number": "3", "response_type": "MCQ",
                 "options": ["(A) 6340", "B. 63 040", {"text": "630 400"}]}]"#,
        );
        let Some(ResponseConfig::MultipleChoice { options }) = &page.questions[0].response_config else {
            panic!("expected options");
        };
        let labels: Vec<_> = options.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, ["A", "B", "C"]);
        assert_eq!(options[1].text, "63 040");
        assert!(options.iter().all(|o| !o.is_correct));
    }

    #[test]
    fn options_imply_multiple_choice() {
        let page = parse(r#"[{"question_number": "1", "options": ["A. yes", "B. no"]}]"#);
        assert_eq!(page.questions[0].response_type, ResponseType::MultipleChoice);
    }

    #[test]
    fn bands_from_position_or_order() {
        let page = parse(
            r#"[{"question_number": "1"}, {"question_number": "2", "position": "bottom"},
                {"question_number": "3", "subparts": [{"part_label": "a"}]}]"#,
        );
        let bands: Vec<_> = page.questions.iter().map(|q| q.source.band).collect();
        assert_eq!(bands, [Band::Top, Band::Bottom, Band::Bottom]);
        assert_eq!(page.questions[2].subparts[0].source.band, Band::Bottom);
    }

    #[test]
    fn nested_diagrams_default_to_their_question() {
        let page = parse(
            r#"{"questions": [{"question_number": "5", "subparts": [
                    {"part_label": "a", "diagrams": [{"description": "triangle", "type": "geometry",
                        "bounding_box": {"x_min": 50, "y_min": 200, "x_max": 300, "y_max": 400}}]}]}],
                "diagrams": [{"description": "loose", "bbox": [0, 0, 10, 10], "associated_question": "6"},
                             {"description": "no box", "bounding_box": "n/a"}]}"#,
        );
        assert_eq!(page.descriptors.len(), 3);
        assert_eq!(page.descriptors[0].associated_question, "5(a)");
        assert_eq!(page.descriptors[0].diagram_type, DiagramType::GeometricFigure);
        let rect = page.descriptors[0].rect.unwrap();
        assert_eq!((rect.x_min, rect.y_max, rect.scale), (50.0, 400.0, Scale::Inference));
        assert_eq!(page.descriptors[1].associated_question, "6");
        assert!(page.descriptors[2].rect.is_none());
        assert!(page.descriptors.iter().all(|d| d.source_page == 2));
    }

    #[test]
    fn typed_configs() {
        let page = parse(
            r#"[{"question_number": "1", "response_type": "fill_blank", "blanks": ["___", "___"]},
                {"question_number": "2", "response_type": "long_answer", "word_limit": "150 words"},
                {"question_number": "3", "response_type": "matching",
                 "pairs": [{"left": "cat", "right": "mammal"}]},
                {"question_number": "4", "response_type": "working"}]"#,
        );
        assert_eq!(
            page.questions[0].response_config,
            Some(ResponseConfig::FillBlank {
                blanks: vec!["___".into(), "___".into()]
            })
        );
        assert_eq!(
            page.questions[1].response_config,
            Some(ResponseConfig::LongAnswer { word_limit: Some(150) })
        );
        assert!(matches!(
            &page.questions[2].response_config,
            Some(ResponseConfig::Matching { pairs }) if pairs[0].right == "mammal"
        ));
        assert_eq!(
            page.questions[3].response_config,
            Some(ResponseConfig::WorkingArea { show_working: true })
        );
    }
}
