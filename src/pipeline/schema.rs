//! Typed schemas for model responses, and the single decode step that
//! isolates every "unknown shape" risk.
//!
//! Vision models are loose with JSON: question numbers arrive as numbers or
//! strings, marks as `2` or `"[2 marks]"`, bounding boxes as named corners,
//! `x1/y1/x2/y2` or a bare array, and the whole object may be wrapped in a
//! markdown fence or trailed by commentary. Everything here is `Option` or
//! `#[serde(default)]` so a partial answer still decodes; downstream code
//! then works on these fixed types instead of `serde_json::Value`.
//!
//! ## Recovery order
//!
//! 1. the trimmed text as-is
//! 2. the body of a ```` ```json ```` fence
//! 3. the first balanced `{…}` or `[…]` block

use crate::error::DecodeError;
use crate::geometry::{Rect, Scale};
use crate::model::{AnswerKey, MarkingCriterion, SolutionStep};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

// ── Lenient field decoders ───────────────────────────────────────────────

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap());

/// String, number or bool as text; anything else (including `""`) is `None`.
fn value_text(v: Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(value_text))
}

/// Number, or the first number inside a string (`"[2 marks]"` → 2).
fn opt_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => NUMBER_RE.find(&s).and_then(|m| m.as_str().parse().ok()),
        _ => None,
    })
}

/// A list of scalars, or one scalar, as strings.
fn text_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Array(items)) => items.into_iter().filter_map(value_text).collect(),
        Some(other) => value_text(other).into_iter().collect(),
        None => Vec::new(),
    })
}

/// A box in any known shape; an unreadable box is `None` instead of
/// failing the whole page.
fn opt_box<'de, D: Deserializer<'de>>(d: D) -> Result<Option<RawBox>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(|v| serde_json::from_value(v).ok()))
}

// ── Question extraction ──────────────────────────────────────────────────

/// Response of the combined question + diagram extraction call.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PageExtraction {
    Object {
        #[serde(default)]
        questions: Vec<RawQuestion>,
        /// Page-level diagrams not nested under a question.
        #[serde(default)]
        diagrams: Vec<RawDiagram>,
    },
    Bare(Vec<RawQuestion>),
}

impl PageExtraction {
    pub fn into_parts(self) -> (Vec<RawQuestion>, Vec<RawDiagram>) {
        match self {
            PageExtraction::Object { questions, diagrams } => (questions, diagrams),
            PageExtraction::Bare(questions) => (questions, Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawQuestion {
    #[serde(default, deserialize_with = "opt_text")]
    pub question_number: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub part_label: Option<String>,
    #[serde(default, alias = "text", alias = "stem", deserialize_with = "opt_text")]
    pub question_text: Option<String>,
    #[serde(default, alias = "stem_latex", deserialize_with = "opt_text")]
    pub question_text_latex: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub question_text_html: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub response_type: Option<String>,
    #[serde(default)]
    pub options: Vec<RawOption>,
    #[serde(default, deserialize_with = "text_list")]
    pub blanks: Vec<String>,
    #[serde(default, deserialize_with = "opt_number")]
    pub word_limit: Option<f64>,
    #[serde(default)]
    pub pairs: Vec<RawPair>,
    #[serde(default, deserialize_with = "text_list")]
    pub labels: Vec<String>,
    #[serde(default, deserialize_with = "opt_number")]
    pub marks: Option<f64>,
    #[serde(default, deserialize_with = "opt_text")]
    pub position: Option<String>,
    #[serde(default)]
    pub subparts: Vec<RawQuestion>,
    #[serde(default)]
    pub diagrams: Vec<RawDiagram>,
    #[serde(default, deserialize_with = "opt_number")]
    pub confidence: Option<f64>,
}

/// A multiple-choice option: `{"label": "A", "text": "…"}` or a plain
/// string such as `"(B) 63 040"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawOption {
    Labeled {
        #[serde(default, deserialize_with = "opt_text")]
        label: Option<String>,
        #[serde(default, alias = "option_text", deserialize_with = "opt_text")]
        text: Option<String>,
    },
    Plain(String),
}

static OPTION_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\(?([A-Za-z]|\d{1,2})(?:\)|[.:]\s)\s*(.*)$").unwrap());

impl RawOption {
    /// `(label, text)`, falling back to `fallback_label` when the option
    /// carried none.
    pub fn split(self, fallback_label: &str) -> (String, String) {
        match self {
            RawOption::Labeled { label, text } => (
                label.unwrap_or_else(|| fallback_label.to_string()),
                text.unwrap_or_default(),
            ),
            RawOption::Plain(s) => match OPTION_PREFIX_RE.captures(&s) {
                Some(c) => (c[1].to_string(), c[2].trim().to_string()),
                None => (fallback_label.to_string(), s.trim().to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPair {
    #[serde(default, deserialize_with = "opt_text")]
    pub left: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub right: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDiagram {
    #[serde(default, alias = "description", deserialize_with = "opt_text")]
    pub diagram_description: Option<String>,
    #[serde(default, alias = "type", deserialize_with = "opt_text")]
    pub diagram_type: Option<String>,
    #[serde(default, alias = "bbox", deserialize_with = "opt_box")]
    pub bounding_box: Option<RawBox>,
    #[serde(default, deserialize_with = "opt_text")]
    pub associated_question: Option<String>,
    #[serde(default, deserialize_with = "opt_number")]
    pub confidence: Option<f64>,
}

/// A bounding box in any of the shapes models produce.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawBox {
    Named {
        x_min: f64,
        y_min: f64,
        x_max: f64,
        y_max: f64,
    },
    Corners {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    },
    Array(Vec<f64>),
}

impl RawBox {
    /// Rectangle on `scale`; `None` for a malformed or non-finite box.
    pub fn to_rect(&self, scale: Scale) -> Option<Rect> {
        let [a, b, c, d] = match self {
            RawBox::Named {
                x_min,
                y_min,
                x_max,
                y_max,
            } => [*x_min, *y_min, *x_max, *y_max],
            RawBox::Corners { x1, y1, x2, y2 } => [*x1, *y1, *x2, *y2],
            RawBox::Array(v) if v.len() == 4 => [v[0], v[1], v[2], v[3]],
            RawBox::Array(_) => return None,
        };
        [a, b, c, d]
            .iter()
            .all(|v| v.is_finite())
            .then(|| Rect::new(a, b, c, d, scale))
    }
}

// ── Page classification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PageClassification {
    #[serde(default, alias = "type", deserialize_with = "opt_text")]
    pub page_type: Option<String>,
    #[serde(default, deserialize_with = "opt_number")]
    pub confidence: Option<f64>,
}

impl PageClassification {
    pub fn is_answer_page(&self) -> bool {
        self.page_type.as_deref().is_some_and(|t| {
            let t = t.to_ascii_lowercase();
            t.contains("answer") || t.contains("solution") || t.contains("marking")
        })
    }
}

// ── Answer extraction ────────────────────────────────────────────────────

/// Response of the answer-extraction call: `{"answers": […]}`, a bare
/// array, or a map from question number to answer.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnswerSheet {
    Object { answers: Vec<RawAnswer> },
    Bare(Vec<RawAnswer>),
    Keyed(BTreeMap<String, KeyedAnswer>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeyedAnswer {
    Record(RawAnswer),
    Text(String),
}

impl AnswerSheet {
    /// Answer keys in response order; entries without a question reference
    /// are dropped.
    pub fn into_keys(self) -> Vec<AnswerKey> {
        let raws: Vec<RawAnswer> = match self {
            AnswerSheet::Object { answers } | AnswerSheet::Bare(answers) => answers,
            AnswerSheet::Keyed(map) => map
                .into_iter()
                .map(|(number, entry)| {
                    let mut raw = match entry {
                        KeyedAnswer::Record(raw) => raw,
                        KeyedAnswer::Text(text) => RawAnswer {
                            final_answer: Some(text),
                            ..Default::default()
                        },
                    };
                    if raw.question_ref.is_none() {
                        raw.question_ref = Some(number);
                    }
                    raw
                })
                .collect(),
        };
        raws.into_iter().filter_map(RawAnswer::into_answer_key).collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAnswer {
    #[serde(default, deserialize_with = "opt_text")]
    pub question_ref: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub question_number: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub final_answer: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub answer: Option<String>,
    #[serde(default, deserialize_with = "text_list")]
    pub acceptable_answers: Vec<String>,
    #[serde(default)]
    pub worked_solution: Vec<RawStep>,
    #[serde(default)]
    pub marking_rubric: Vec<RawCriterion>,
    #[serde(default)]
    pub marks_breakdown: Vec<RawCriterion>,
    #[serde(default, deserialize_with = "opt_text")]
    pub explanation: Option<String>,
}

impl RawAnswer {
    pub fn into_answer_key(self) -> Option<AnswerKey> {
        let question_ref = self.question_ref.or(self.question_number)?;
        let worked_solution = self
            .worked_solution
            .into_iter()
            .enumerate()
            .map(|(i, step)| step.into_step(i as u32 + 1))
            .collect();
        let marking_rubric = self
            .marking_rubric
            .into_iter()
            .chain(self.marks_breakdown)
            .filter_map(RawCriterion::into_criterion)
            .collect();

        Some(AnswerKey {
            question_ref,
            final_answer: self.final_answer.or(self.answer).unwrap_or_default(),
            acceptable_answers: self.acceptable_answers,
            worked_solution,
            marking_rubric,
            explanation: self.explanation,
        })
    }
}

/// A worked-solution step, either structured or a plain sentence.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawStep {
    Detailed {
        #[serde(default, deserialize_with = "opt_number")]
        step: Option<f64>,
        #[serde(default, deserialize_with = "opt_text")]
        description: Option<String>,
        #[serde(default, deserialize_with = "opt_text")]
        expression: Option<String>,
        #[serde(default, deserialize_with = "opt_text")]
        expression_latex: Option<String>,
    },
    Plain(String),
}

impl RawStep {
    fn into_step(self, position: u32) -> SolutionStep {
        match self {
            RawStep::Detailed {
                step,
                description,
                expression,
                expression_latex,
            } => SolutionStep {
                step: step
                    .filter(|s| *s >= 1.0)
                    .map_or(position, |s| s as u32),
                description: description.unwrap_or_default(),
                expression,
                expression_latex,
            },
            RawStep::Plain(text) => SolutionStep {
                step: position,
                description: text,
                expression: None,
                expression_latex: None,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCriterion {
    #[serde(default, alias = "description", deserialize_with = "opt_text")]
    pub criterion: Option<String>,
    #[serde(default, deserialize_with = "opt_number")]
    pub marks: Option<f64>,
}

impl RawCriterion {
    fn into_criterion(self) -> Option<MarkingCriterion> {
        Some(MarkingCriterion {
            criterion: self.criterion?,
            marks: self.marks.unwrap_or(0.0),
        })
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────

/// Locate the JSON payload inside a model reply.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if serde_json::from_str::<serde::de::IgnoredAny>(trimmed).is_ok() {
            return Some(trimmed);
        }
    }
    if let Some(body) = fenced_body(trimmed) {
        if serde_json::from_str::<serde::de::IgnoredAny>(body).is_ok() {
            return Some(body);
        }
    }
    balanced_block(trimmed)
}

fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the info string ("json") up to the end of the fence line.
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// First balanced `{…}` / `[…]` block, string- and escape-aware.
fn balanced_block(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode a model reply into `T`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, DecodeError> {
    let json = extract_json(text).ok_or(DecodeError::NoJson { len: text.len() })?;
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fenced_reply_with_lenient_fields() {
        let reply = r#"Here you go:
```json
{"questions": [{"question_number": 7, "question_text": "Area?", "marks": "[2 marks]",
  "response_type": "WORKING_AREA",
  "diagrams": [{"diagram_description": "rect", "diagram_type": "figure",
                "bounding_box": {"x1": 50, "y1": 200, "x2": 300, "y2": 400},
                "associated_question": "7"}]}]}
```"#;
        let (questions, diagrams) = decode::<PageExtraction>(reply).unwrap().into_parts();
        assert!(diagrams.is_empty());
        let q = &questions[0];
        assert_eq!(q.question_number.as_deref(), Some("7"));
        assert_eq!(q.marks, Some(2.0));
        let rect = q.diagrams[0]
            .bounding_box
            .as_ref()
            .and_then(|b| b.to_rect(Scale::Inference))
            .unwrap();
        assert_eq!((rect.x_min, rect.y_max), (50.0, 400.0));
    }

    #[test]
    fn bare_array_and_trailing_commentary() {
        let reply = r#"[{"question_number": "1", "options": ["(A) 6340", {"label": "B", "text": "63 040"}]}] hope this helps {"#;
        let (questions, _) = decode::<PageExtraction>(reply).unwrap().into_parts();
        let opts: Vec<_> = questions[0]
            .options
            .iter()
            .cloned()
            .map(|o| o.split("?"))
            .collect();
        assert_eq!(opts[0], ("A".to_string(), "6340".to_string()));
        assert_eq!(opts[1], ("B".to_string(), "63 040".to_string()));

        let (label, text) = RawOption::Plain("3.5 cm".into()).split("C");
        assert_eq!((label.as_str(), text.as_str()), ("C", "3.5 cm"));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_scanner() {
        let text = r#"note {"answers": [{"question_ref": "2", "final_answer": "{x | x > 1}"}]} end"#;
        let keys = decode::<AnswerSheet>(text).unwrap().into_keys();
        assert_eq!(keys[0].final_answer, "{x | x > 1}");
    }

    #[test]
    fn answer_aliases_and_rubric_merge() {
        let text = r#"{"answers": [
            {"question_number": "7a", "answer": "6x + 4",
             "worked_solution": [{"description": "Perimeter"}, "Simplify"],
             "marks_breakdown": [{"criterion": "Formula", "marks": "1"}]},
            {"final_answer": "orphan"}
        ]}"#;
        let keys = decode::<AnswerSheet>(text).unwrap().into_keys();
        assert_eq!(keys.len(), 1);
        let k = &keys[0];
        assert_eq!(k.question_ref, "7a");
        assert_eq!(k.final_answer, "6x + 4");
        assert_eq!(k.worked_solution[1].step, 2);
        assert_eq!(k.worked_solution[1].description, "Simplify");
        assert_eq!(k.marking_rubric[0].marks, 1.0);
    }

    #[test]
    fn keyed_answer_map() {
        let keys = decode::<AnswerSheet>(r#"{"1": "B", "2": {"final_answer": 42}}"#)
            .unwrap()
            .into_keys();
        assert_eq!(keys[0].question_ref, "1");
        assert_eq!(keys[0].final_answer, "B");
        assert_eq!(keys[1].final_answer, "42");
    }

    #[test]
    fn classification() {
        let c: PageClassification = decode(r#"{"page_type": "answer_key", "confidence": 0.9}"#).unwrap();
        assert!(c.is_answer_page());
        let c: PageClassification = decode(r#"{"page_type": "question"}"#).unwrap();
        assert!(!c.is_answer_page());
    }

    #[test]
    fn no_json_is_reported() {
        let err = decode::<PageClassification>("I cannot read this page").unwrap_err();
        assert!(matches!(err, DecodeError::NoJson { .. }));
    }

    #[test]
    fn unreadable_box_does_not_fail_the_page() {
        let reply = r#"{"questions": [{"question_number": "4",
            "diagrams": [{"description": "graph", "bounding_box": "somewhere top left"}]}]}"#;
        let (questions, _) = decode::<PageExtraction>(reply).unwrap().into_parts();
        assert!(questions[0].diagrams[0].bounding_box.is_none());
    }

    #[test]
    fn malformed_box_is_none() {
        let b = RawBox::Array(vec![1.0, 2.0, 3.0]);
        assert!(b.to_rect(Scale::Inference).is_none());
    }
}
