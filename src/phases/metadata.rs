//! Phase 2: paper metadata from the document name, with the first page's
//! text as a fallback. Pure heuristics; never fails, unmatched fields stay
//! `None`.
//!
//! Names like `2023_P6_Maths_SA2_Nanyang_Primary.pdf` are the common case:
//! year, grade, subject and exam type are recognised token by token and
//! whatever is left over is taken as the school, provided it looks like one
//! (two or more words, or a word such as `Primary` or `School`).

use crate::model::{ExamMetadata, PageContent, Subject};
use crate::pipeline::input::{document_name, is_url};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::debug;

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^0-9])((?:19|20)\d{2})(?:[^0-9]|$)").unwrap());

static GRADE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z])(?:(p|pri|primary)|(s|sec|secondary)|(grade|gr))[\s_-]*(\d{1,2})(?:[^0-9]|$)")
        .unwrap()
});

static TOTAL_MARKS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)total(?:\s+marks?)?\s*[:=]?\s*(\d{1,3})\b|\b(\d{1,3})\s*marks?\s+in\s+total").unwrap()
});

/// Checked in order: the more specific subject wins ("Science" is a
/// substring of many names, "Physics" is not).
const SUBJECTS: &[(&str, Subject)] = &[
    ("physics", Subject::Physics),
    ("chemistry", Subject::Chemistry),
    ("biology", Subject::Biology),
    ("math", Subject::Mathematics),
    ("science", Subject::Science),
    ("english", Subject::English),
];

const EXAM_TYPES: &[(&str, &str)] = &[
    ("sa1", "SA1"),
    ("sa2", "SA2"),
    ("ca1", "CA1"),
    ("ca2", "CA2"),
    ("prelim", "Preliminary Exam"),
    ("midyear", "Mid-Year"),
    ("final", "Final Exam"),
    ("mock", "Mock Exam"),
];

/// Tokens that never belong to a school name.
const NOISE: &[&str] = &[
    "exam", "exams", "paper", "papers", "test", "pdf", "questions", "answers", "answer", "key", "and", "mid", "year",
    "booklet", "section",
];

/// A single leftover word only counts as a school with one of these.
const SCHOOL_WORDS: &[&str] = &[
    "primary", "secondary", "school", "college", "academy", "institution", "convent", "high",
];

/// Derive [`ExamMetadata`] for `document` (path or URL).
pub fn run(document: &str, pages: &[PageContent]) -> ExamMetadata {
    let name = document_name(document);
    let first_page: String = pages
        .first()
        .map(|p| p.text.chars().take(500).collect())
        .unwrap_or_default();

    let metadata = ExamMetadata {
        source_file: source_file(document),
        subject: detect_subject(&name).or_else(|| detect_subject(&first_page)).unwrap_or_default(),
        grade_level: detect_grade(&name).or_else(|| detect_grade(&first_page)),
        exam_type: detect_exam_type(&name).or_else(|| detect_exam_type(&first_page)),
        school: detect_school(&name),
        year: detect_year(&name).or_else(|| detect_year(&first_page)),
        total_marks: detect_total_marks(&first_page),
        page_count: pages.len(),
    };
    debug!("Metadata for {}: {:?}", name, metadata);
    metadata
}

fn source_file(document: &str) -> String {
    if is_url(document) {
        return document
            .rsplit('/')
            .find(|s| !s.is_empty())
            .map(|s| s.split(['?', '#']).next().unwrap_or(s).to_string())
            .unwrap_or_else(|| document.to_string());
    }
    Path::new(document)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| document.to_string())
}

pub fn detect_subject(text: &str) -> Option<Subject> {
    let lower = text.to_lowercase();
    SUBJECTS
        .iter()
        .find(|(kw, _)| lower.contains(kw))
        .map(|(_, subject)| *subject)
}

pub fn detect_year(text: &str) -> Option<i32> {
    YEAR_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn detect_grade(text: &str) -> Option<String> {
    let caps = GRADE_RE.captures(text)?;
    let n = caps.get(4)?.as_str().trim_start_matches('0');
    if n.is_empty() {
        return None;
    }
    if caps.get(1).is_some() {
        let n: u32 = n.parse().ok()?;
        (1..=6).contains(&n).then(|| format!("P{n}"))
    } else if caps.get(2).is_some() {
        let n: u32 = n.parse().ok()?;
        (1..=5).contains(&n).then(|| format!("S{n}"))
    } else {
        Some(format!("Grade {n}"))
    }
}

pub fn detect_exam_type(text: &str) -> Option<String> {
    let compact: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    EXAM_TYPES
        .iter()
        .find(|(kw, _)| compact.contains(kw))
        .map(|(_, label)| label.to_string())
}

fn detect_total_marks(text: &str) -> Option<f64> {
    let caps = TOTAL_MARKS_RE.captures(text)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// Leftover alphabetic tokens of the name once every recognised field is
/// removed, joined with spaces. A lone leftover word (`scan`, `final2`) is
/// file-name noise unless it is a school word.
pub fn detect_school(name: &str) -> Option<String> {
    let tokens: Vec<&str> = name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let mut school = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let lower = token.to_lowercase();
        let next_is_number = tokens
            .get(i + 1)
            .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()));
        let grade_word = matches!(lower.as_str(), "p" | "pri" | "primary" | "s" | "sec" | "secondary" | "grade" | "gr");

        if token.chars().any(|c| c.is_ascii_digit())
            || (grade_word && next_is_number)
            || detect_subject(&lower).is_some()
            || detect_exam_type(&lower).is_some()
            || NOISE.contains(&lower.as_str())
            || lower.len() < 2
        {
            continue;
        }
        school.push(*token);
    }

    let has_school_word = school
        .iter()
        .any(|t| SCHOOL_WORDS.contains(&t.to_lowercase().as_str()));
    (school.len() >= 2 || has_school_word).then(|| school.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn page(text: &str) -> PageContent {
        PageContent::new(0, text, DynamicImage::new_rgb8(4, 4))
    }

    #[test]
    fn typical_file_name() {
        let m = run("/papers/2023_P6_Maths_SA2_Nanyang_Primary.pdf", &[page("")]);
        assert_eq!(m.source_file, "2023_P6_Maths_SA2_Nanyang_Primary.pdf");
        assert_eq!(m.subject, Subject::Mathematics);
        assert_eq!(m.year, Some(2023));
        assert_eq!(m.grade_level.as_deref(), Some("P6"));
        assert_eq!(m.exam_type.as_deref(), Some("SA2"));
        assert_eq!(m.school.as_deref(), Some("Nanyang Primary"));
        assert_eq!(m.page_count, 1);
    }

    #[test]
    fn specific_subject_beats_science() {
        assert_eq!(detect_subject("Sec 3 Physics (Science) Prelim"), Some(Subject::Physics));
        assert_eq!(detect_subject("P5 Science"), Some(Subject::Science));
        assert_eq!(detect_subject("untitled"), None);
    }

    #[test]
    fn grade_patterns() {
        assert_eq!(detect_grade("Primary 4 English").as_deref(), Some("P4"));
        assert_eq!(detect_grade("sec-2 chem").as_deref(), Some("S2"));
        assert_eq!(detect_grade("Grade 10 Biology").as_deref(), Some("Grade 10"));
        assert_eq!(detect_grade("p9 nonsense"), None);
        assert_eq!(detect_grade("map3"), None);
    }

    #[test]
    fn exam_types() {
        assert_eq!(detect_exam_type("Mid-Year Exam").as_deref(), Some("Mid-Year"));
        assert_eq!(detect_exam_type("prelims").as_deref(), Some("Preliminary Exam"));
        assert_eq!(detect_exam_type("weekly quiz"), None);
    }

    #[test]
    fn first_page_fills_the_gaps() {
        let m = run(
            "https://example.com/files/scan_001.pdf?dl=1",
            &[page("MATHEMATICS  Primary 5  2021\nTotal: 100 marks")],
        );
        assert_eq!(m.source_file, "scan_001.pdf");
        assert_eq!(m.subject, Subject::Mathematics);
        assert_eq!(m.grade_level.as_deref(), Some("P5"));
        assert_eq!(m.year, Some(2021));
        assert_eq!(m.total_marks, Some(100.0));
        assert!(m.school.is_none());
    }

    #[test]
    fn school_needs_two_words_or_a_school_word() {
        assert_eq!(detect_school("scan_001"), None);
        assert_eq!(detect_school("IMG_20230412"), None);
        assert_eq!(detect_school("2022_P5_Tao_Nan_SA1").as_deref(), Some("Tao Nan"));
        assert_eq!(detect_school("Rosyth-School-2021").as_deref(), Some("Rosyth School"));
        assert_eq!(detect_school("P6_Science_College").as_deref(), Some("College"));
    }

    #[test]
    fn nothing_recognised_leaves_fields_empty() {
        let m = run("12345.pdf", &[]);
        assert_eq!(m.subject, Subject::Other);
        assert!(m.year.is_none() && m.grade_level.is_none() && m.exam_type.is_none());
        assert!(m.school.is_none());
        assert_eq!(m.page_count, 0);
    }
}
