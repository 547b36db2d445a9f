//! Question-number canonicalisation.
//!
//! Papers, models and answer keys all spell the same question differently:
//! `7(a)`, `7. a`, `7 a`, `Q7a`, `7a.`. Every cross-phase match (diagram to
//! question, answer to question) compares [`normalize`]d forms byte for byte.
//!
//! Rules, applied in order:
//!
//! 1. lower-case
//! 2. drop all whitespace
//! 3. drop parentheses and brackets
//! 4. drop `.` unless it sits between two digits (`1.5` survives, `7.a` does not)
//! 5. strip trailing punctuation
//! 6. strip one leading `question` / `q` prefix when a digit follows
//!
//! The function is total and idempotent.

/// Canonical form of a question-number string.
pub fn normalize(raw: &str) -> String {
    let compact: Vec<char> = raw
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '[' | ']'))
        .collect();

    let mut out = String::with_capacity(compact.len());
    for (i, &c) in compact.iter().enumerate() {
        if c == '.' {
            let digit_before = i > 0 && compact[i - 1].is_ascii_digit();
            let digit_after = compact.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if !(digit_before && digit_after) {
                continue;
            }
        }
        out.push(c);
    }

    let trimmed = out.trim_end_matches(|c: char| c.is_ascii_punctuation());
    strip_prefix(trimmed).to_string()
}

fn strip_prefix(s: &str) -> &str {
    s.strip_prefix("question")
        .filter(|r| starts_with_digit(r))
        .or_else(|| s.strip_prefix('q').filter(|r| starts_with_digit(r)))
        .unwrap_or(s)
}

fn starts_with_digit(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Whether two raw question numbers refer to the same question.
///
/// Empty identifiers never match anything, including each other.
pub fn same_question(a: &str, b: &str) -> bool {
    let a = normalize(a);
    !a.is_empty() && a == normalize(b)
}
