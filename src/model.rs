//! Data model for extracted exam papers.
//!
//! The root artifact is [`ExamPaper`]: metadata, a forest of [`Question`]s
//! and the run's [`ExtractionMetrics`]. Everything here is plain data with
//! `serde` derives so the CLI (or any host) can write it straight to JSON.
//!
//! ## Ownership
//!
//! A question exclusively owns its `subparts`. The only back reference is
//! `parent_id`, a plain id used for lookups, never for traversal. Subparts are
//! built once from the same response as their parent and are never moved
//! between trees afterwards, which keeps the forest acyclic by construction.
//!
//! Diagrams are values. A diagram attached to several questions is stored as
//! a copy under each of them with the same `id`; `shared_with_questions`
//! lists every holder with the canonical owner first.

use crate::geometry::{Band, Rect};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

// ── Pages ────────────────────────────────────────────────────────────────

/// One parsed page: its text layer and rendered raster.
#[derive(Clone)]
pub struct PageContent {
    /// 0-based page index.
    pub index: usize,
    pub text: String,
    pub image: Arc<DynamicImage>,
    /// Raster width in pixels.
    pub width: u32,
    /// Raster height in pixels.
    pub height: u32,
}

impl PageContent {
    pub fn new(index: usize, text: impl Into<String>, image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            index,
            text: text.into(),
            image: Arc::new(image),
            width,
            height,
        }
    }

    /// 1-based page number for messages.
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

impl fmt::Debug for PageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageContent")
            .field("index", &self.index)
            .field("text_len", &self.text.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

// ── Enumerations ─────────────────────────────────────────────────────────

/// Kind of response a question expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    MultipleChoice,
    #[default]
    ShortAnswer,
    LongAnswer,
    WorkingArea,
    FillBlank,
    TrueFalse,
    Matching,
    DiagramLabel,
}

impl ResponseType {
    /// Lenient parse of a model-supplied label; unknown labels are `None`.
    pub fn parse(label: &str) -> Option<Self> {
        let key: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let kind = match key.as_str() {
            "mcq" | "multiplechoice" | "mc" | "choice" => ResponseType::MultipleChoice,
            "shortanswer" | "short" | "oneword" | "numeric" => ResponseType::ShortAnswer,
            "longanswer" | "long" | "essay" | "openended" | "structured" => ResponseType::LongAnswer,
            "workingarea" | "working" | "showworking" | "calculation" => ResponseType::WorkingArea,
            "fillinblank" | "fillintheblank" | "fillblank" | "cloze" => ResponseType::FillBlank,
            "truefalse" | "tf" | "trueorfalse" => ResponseType::TrueFalse,
            "matching" | "match" => ResponseType::Matching,
            "diagramlabel" | "labeldiagram" | "labelling" | "labeling" => ResponseType::DiagramLabel,
            _ => return None,
        };
        Some(kind)
    }
}

/// Coarse category of a diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagramType {
    Graph,
    GeometricFigure,
    Chart,
    Illustration,
    Table,
    Circuit,
    #[default]
    Diagram,
    Map,
    Scientific,
}

impl DiagramType {
    /// Lenient parse; anything unrecognised becomes [`DiagramType::Diagram`].
    pub fn from_label(label: &str) -> Self {
        let l = label.trim().to_ascii_lowercase();
        if l.contains("graph") || l.contains("plot") {
            DiagramType::Graph
        } else if l.contains("chart") {
            DiagramType::Chart
        } else if l.contains("geometr") || l.contains("figure") || l.contains("shape") {
            DiagramType::GeometricFigure
        } else if l.contains("table") {
            DiagramType::Table
        } else if l.contains("circuit") {
            DiagramType::Circuit
        } else if l.contains("map") {
            DiagramType::Map
        } else if l.contains("scien") || l.contains("apparatus") || l.contains("experiment") {
            DiagramType::Scientific
        } else if l.contains("illustration") || l.contains("picture") || l.contains("image") {
            DiagramType::Illustration
        } else {
            DiagramType::Diagram
        }
    }
}

/// Subject of the paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Subject {
    Mathematics,
    Science,
    Physics,
    Chemistry,
    Biology,
    English,
    #[default]
    Other,
}

/// Pipeline phase, used to tag error records and progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Parse,
    Metadata,
    Questions,
    Diagrams,
    Answers,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Parse => "parse",
            Phase::Metadata => "metadata",
            Phase::Questions => "questions",
            Phase::Diagrams => "diagrams",
            Phase::Answers => "answers",
            Phase::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

// ── Diagrams ─────────────────────────────────────────────────────────────

/// A diagram candidate reported by combined extraction, before linking.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagramDescriptor {
    pub description: String,
    pub diagram_type: DiagramType,
    /// Model-grid box; `None` when the response carried no usable box.
    pub rect: Option<Rect>,
    /// Raw question number the model associated with the diagram.
    pub associated_question: String,
    /// 0-based page the diagram was seen on.
    pub source_page: usize,
    pub confidence: Option<f64>,
}

/// Where a materialised diagram image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum DiagramImage {
    /// PNG embedded as a `data:image/png;base64,…` URI.
    Inline { data_uri: String },
    /// PNG written to disk.
    File { path: PathBuf },
}

/// A linked, materialised diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    pub id: String,
    pub diagram_type: DiagramType,
    pub description: String,
    /// Storage-scale (percent) bounding box.
    pub rect: Rect,
    /// 0-based page the diagram was cropped from.
    pub source_page: usize,
    pub image: DiagramImage,
    pub confidence: f64,
    pub is_shared: bool,
    /// Ids of every question holding this diagram, canonical owner first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_with_questions: Vec<String>,
}

// ── Questions ────────────────────────────────────────────────────────────

/// Question text and its alternate renderings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_latex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_html: Option<String>,
}

/// One multiple-choice option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McqOption {
    pub label: String,
    pub text: String,
    pub is_correct: bool,
}

/// One left/right pair of a matching question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingPair {
    pub left: String,
    pub right: String,
}

/// Response configuration; the variant follows the question's response type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseConfig {
    MultipleChoice { options: Vec<McqOption> },
    FillBlank { blanks: Vec<String> },
    LongAnswer { word_limit: Option<u32> },
    WorkingArea { show_working: bool },
    TrueFalse,
    Matching { pairs: Vec<MatchingPair> },
    DiagramLabel { labels: Vec<String> },
}

/// Where on the paper a question was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSource {
    /// 0-based page index.
    pub page_index: usize,
    pub band: Band,
}

/// A question node. Subparts are owned children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    /// Raw question number as printed; may be empty.
    pub question_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub content: QuestionContent,
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_config: Option<ResponseConfig>,
    pub marks: Option<f64>,
    #[serde(default)]
    pub diagrams: Vec<Diagram>,
    pub answer_key: Option<AnswerKey>,
    #[serde(default)]
    pub subparts: Vec<Question>,
    /// 0 for top-level questions.
    pub depth: u32,
    pub source: QuestionSource,
    pub confidence: f64,
}

impl Question {
    /// Pre-order traversal of this node and its descendants.
    pub fn walk<'a>(&'a self, out: &mut Vec<&'a Question>) {
        out.push(self);
        for sub in &self.subparts {
            sub.walk(out);
        }
    }

    /// Mutable pre-order visit.
    pub fn visit_mut(&mut self, f: &mut dyn FnMut(&mut Question)) {
        f(self);
        for sub in &mut self.subparts {
            sub.visit_mut(f);
        }
    }

    /// Find a node by id in this subtree.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut Question> {
        if self.id == id {
            return Some(self);
        }
        self.subparts.iter_mut().find_map(|s| s.find_mut(id))
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.subparts.iter().map(Question::node_count).sum::<usize>()
    }

    /// Check the forest invariants for this subtree: every child sits one
    /// level deeper than its parent, names its parent, and no id repeats.
    pub fn is_well_formed(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.check_node(None, &mut seen)
    }

    fn check_node<'a>(
        &'a self,
        parent: Option<&Question>,
        seen: &mut std::collections::HashSet<&'a str>,
    ) -> bool {
        if !seen.insert(self.id.as_str()) {
            return false;
        }
        let linked = match parent {
            None => self.parent_id.is_none(),
            Some(p) => self.depth == p.depth + 1 && self.parent_id.as_deref() == Some(&p.id),
        };
        linked && self.subparts.iter().all(|s| s.check_node(Some(self), seen))
    }
}

/// Pre-order list of every node in a forest.
pub fn flatten(forest: &[Question]) -> Vec<&Question> {
    let mut out = Vec::new();
    for q in forest {
        q.walk(&mut out);
    }
    out
}

/// Find a node by id anywhere in a forest.
pub fn find_in_forest_mut<'a>(forest: &'a mut [Question], id: &str) -> Option<&'a mut Question> {
    forest.iter_mut().find_map(|q| q.find_mut(id))
}

// ── Answers ──────────────────────────────────────────────────────────────

/// One step of a worked solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionStep {
    pub step: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression_latex: Option<String>,
}

/// One marking-scheme criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkingCriterion {
    pub criterion: String,
    pub marks: f64,
}

/// Answer key for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerKey {
    /// Question number as printed in the answer key.
    pub question_ref: String,
    pub final_answer: String,
    #[serde(default)]
    pub acceptable_answers: Vec<String>,
    #[serde(default)]
    pub worked_solution: Vec<SolutionStep>,
    #[serde(default)]
    pub marking_rubric: Vec<MarkingCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

// ── Paper ────────────────────────────────────────────────────────────────

/// Paper-level metadata derived from the file name and first page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExamMetadata {
    pub source_file: String,
    pub subject: Subject,
    pub grade_level: Option<String>,
    pub exam_type: Option<String>,
    pub school: Option<String>,
    pub year: Option<i32>,
    pub total_marks: Option<f64>,
    pub page_count: usize,
}

/// A non-fatal error or warning recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub agent: String,
    pub phase: Phase,
    /// Page the issue is scoped to, **1-indexed** as shown to users.
    ///
    /// Unlike the 0-based `PageContent::index`, `QuestionSource::page_index`
    /// and `Diagram::source_page`; `page_index + 1` gives this value.
    pub page: Option<usize>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Token and cost totals for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub agent: String,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Usage, cost, counts and issues for one document run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetrics {
    pub run_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub elapsed_ms: u64,
    pub pages_processed: usize,
    pub questions_extracted: usize,
    pub diagrams_extracted: usize,
    pub answers_merged: usize,
    pub agents_used: Vec<String>,
    pub usage_by_agent: Vec<AgentUsage>,
    pub errors: Vec<IssueRecord>,
    pub warnings: Vec<IssueRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The extracted paper: the only artifact returned per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamPaper {
    pub metadata: ExamMetadata,
    pub questions: Vec<Question>,
    /// Every answer key read from the paper, matched or not.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer_keys: Vec<AnswerKey>,
    pub metrics: ExtractionMetrics,
}

impl ExamPaper {
    /// Every question node, top-level and subparts, in paper order.
    pub fn all_questions(&self) -> Vec<&Question> {
        flatten(&self.questions)
    }

    /// Distinct diagrams across the paper, in first-seen order.
    pub fn diagrams(&self) -> Vec<&Diagram> {
        let mut seen = std::collections::HashSet::new();
        self.all_questions()
            .into_iter()
            .flat_map(|q| q.diagrams.iter())
            .filter(|d| seen.insert(d.id.as_str()))
            .collect()
    }
}
