//! Prompts for the three vision calls the pipeline makes.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: the JSON shapes described below are the
//!    shapes [`crate::pipeline::schema`] decodes. Changing one without the
//!    other is a bug, and keeping both in view makes that obvious.
//!
//! 2. **Testability**: unit tests can inspect prompts directly without a
//!    real model, so a prompt that stops mentioning a required field is
//!    caught before it reaches a provider.
//!
//! Bounding boxes are requested on a 0–1000 grid; the linker rescales them
//! with [`crate::geometry::to_storage_scale`].

/// System prompt shared by every call.
pub const SYSTEM_PROMPT: &str = "You read scanned exam papers and answer with a single JSON object. \
Do not wrap the JSON in markdown fences and do not add commentary.";

/// Combined question + diagram extraction for one page.
pub const QUESTION_EXTRACTION_PROMPT: &str = r#"Extract every exam question on this page together with any diagrams the questions use.

For each question report:
- question_number: the label exactly as printed ("7", "7a", "7(a)", "Q3")
- question_text: the full wording; use LaTeX for mathematics ($x^2 + 5x = 12$)
- question_text_latex: optional LaTeX-only rendering
- response_type: one of MULTIPLE_CHOICE, SHORT_ANSWER, LONG_ANSWER, WORKING_AREA,
  FILL_IN_BLANK, TRUE_FALSE, MATCHING, DIAGRAM_LABEL
- options: REQUIRED for MULTIPLE_CHOICE, as [{"label": "A", "text": "..."}]; options
  printed after a figure still belong to the question
- marks: number of marks if shown ("[2 marks]", "(3)")
- position: where the question starts on the page: "top", "middle" or "bottom"
- subparts: nested questions for parts (a), (b) or (i), (ii), each with part_label and
  the same fields as a question
- diagrams: figures, graphs, tables or charts the question refers to, each with
  diagram_description, diagram_type, associated_question and
  bounding_box {"x_min", "y_min", "x_max", "y_max"} on a 0-1000 grid of this page
- confidence: 0.0 to 1.0

Answer with:
{
  "questions": [
    {
      "question_number": "7",
      "question_text": "A rectangle has length (2x + 3) cm and width (x - 1) cm.",
      "response_type": "WORKING_AREA",
      "marks": 4,
      "position": "top",
      "subparts": [
        {"part_label": "a", "question_text": "Write an expression for the perimeter.", "response_type": "WORKING_AREA", "marks": 2}
      ],
      "diagrams": [
        {
          "diagram_description": "Rectangle with sides labelled (2x + 3) cm and (x - 1) cm",
          "diagram_type": "figure",
          "bounding_box": {"x_min": 50, "y_min": 200, "x_max": 300, "y_max": 400},
          "associated_question": "7"
        }
      ],
      "confidence": 0.95
    }
  ]
}

Extract partial questions that run off the page as well. If a diagram belongs to a
question printed on another page, still name that question in associated_question."#;

/// Answer-page classification for pages the keyword heuristic did not flag.
pub const PAGE_CLASSIFICATION_PROMPT: &str = r#"Classify this exam page.

- "question": the page mainly contains numbered questions
- "answer_key": the page mainly contains answers, solutions or a marking scheme
  (headers such as "Answer Key" or "Solutions", or patterns such as "1. B", "2. 42")
- "instruction", "cover" or "mixed" otherwise; prefer "answer_key" when answers dominate

Answer with:
{"page_type": "question", "confidence": 0.9}"#;

/// Answer-key extraction for a page classified as an answer page.
pub const ANSWER_EXTRACTION_PROMPT: &str = r#"This page is part of an answer key. Extract every answer on it.

For each answer report:
- question_ref: the question label exactly as printed in the key ("1", "7a", "3(a)")
- final_answer: for multiple choice the option label (A-D or 1-4), otherwise the answer text
- acceptable_answers: other answers that also earn the marks, if listed
- worked_solution: ordered steps [{"step": 1, "description": "...", "expression": "..."}]
- marking_rubric: [{"criterion": "...", "marks": 1}]
- explanation: optional short explanation

Answer with:
{
  "answers": [
    {"question_ref": "1", "final_answer": "B"},
    {
      "question_ref": "7a",
      "final_answer": "6x + 4",
      "worked_solution": [
        {"step": 1, "description": "Perimeter formula", "expression": "P = 2(l + w)"},
        {"step": 2, "description": "Simplify", "expression": "P = 6x + 4"}
      ],
      "marking_rubric": [{"criterion": "Correct simplification", "marks": 1}]
    }
  ]
}"#;

/// User-turn text for the question extraction call: the page's text layer
/// as a reading aid next to the image.
pub fn question_extraction_request(page_number: usize, page_text: &str) -> String {
    let text = page_text.trim();
    if text.is_empty() {
        format!("{QUESTION_EXTRACTION_PROMPT}\n\nThis is page {page_number}.")
    } else {
        format!(
            "{QUESTION_EXTRACTION_PROMPT}\n\nThis is page {page_number}. Its text layer reads:\n\"\"\"\n{text}\n\"\"\""
        )
    }
}

pub fn page_classification_request(page_number: usize) -> String {
    format!("{PAGE_CLASSIFICATION_PROMPT}\n\nThis is page {page_number}.")
}

pub fn answer_extraction_request(page_number: usize, page_text: &str) -> String {
    let text = page_text.trim();
    if text.is_empty() {
        format!("{ANSWER_EXTRACTION_PROMPT}\n\nThis is page {page_number}.")
    } else {
        format!(
            "{ANSWER_EXTRACTION_PROMPT}\n\nThis is page {page_number}. Its text layer reads:\n\"\"\"\n{text}\n\"\"\""
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_prompt_names_decoded_fields() {
        for field in [
            "question_number",
            "response_type",
            "options",
            "subparts",
            "part_label",
            "position",
            "bounding_box",
            "associated_question",
        ] {
            assert!(QUESTION_EXTRACTION_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn answer_prompt_names_decoded_fields() {
        for field in ["question_ref", "final_answer", "worked_solution", "marking_rubric"] {
            assert!(ANSWER_EXTRACTION_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn request_embeds_page_text_only_when_present() {
        let with = question_extraction_request(2, "  1. What is 2+2?  ");
        assert!(with.contains("page 2"));
        assert!(with.contains("1. What is 2+2?"));

        let without = question_extraction_request(3, "   ");
        assert!(!without.contains("text layer"));
    }
}
