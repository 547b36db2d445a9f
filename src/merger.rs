//! Answer merging: attach answer-key records to question nodes.
//!
//! Pure and synchronous. Keys are matched on [`normalize`]d question
//! numbers over the whole forest, subparts included. For multiple-choice
//! questions the matching option is flagged correct when exactly one option
//! matches the key's final answer; otherwise every flag stays false and a
//! warning is returned for the ledger.

use crate::identifier::normalize;
use crate::model::{AnswerKey, McqOption, Question, ResponseConfig, ResponseType};
use std::collections::BTreeMap;
use tracing::debug;

/// Answer keys indexed by normalised question number.
///
/// A later insert for the same number replaces the earlier one, so feeding
/// pages in page order makes the last answer page win.
#[derive(Debug, Clone, Default)]
pub struct AnswerMap {
    keys: BTreeMap<String, AnswerKey>,
}

impl AnswerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key; returns the key it replaced. Keys whose reference
    /// normalises to nothing are ignored.
    pub fn insert(&mut self, key: AnswerKey) -> Option<AnswerKey> {
        let id = normalize(&key.question_ref);
        if id.is_empty() {
            debug!("Ignoring answer key without a question reference");
            return None;
        }
        self.keys.insert(id, key)
    }

    pub fn get(&self, question_number: &str) -> Option<&AnswerKey> {
        self.keys.get(&normalize(question_number))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in normalised-number order.
    pub fn values(&self) -> impl Iterator<Item = &AnswerKey> {
        self.keys.values()
    }
}

impl Extend<AnswerKey> for AnswerMap {
    fn extend<I: IntoIterator<Item = AnswerKey>>(&mut self, iter: I) {
        for key in iter {
            self.insert(key);
        }
    }
}

impl FromIterator<AnswerKey> for AnswerMap {
    fn from_iter<I: IntoIterator<Item = AnswerKey>>(iter: I) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

/// A multiple-choice key that could not be pinned to one option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeWarning {
    pub question_number: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Question nodes that received a key.
    pub merged: usize,
    pub warnings: Vec<MergeWarning>,
}

/// Merge `answers` into every matching node of `forest`, depth first.
pub fn merge_answers(forest: &mut [Question], answers: &AnswerMap) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    if answers.is_empty() {
        return outcome;
    }
    for root in forest.iter_mut() {
        root.visit_mut(&mut |q: &mut Question| {
            let id = normalize(&q.question_number);
            if id.is_empty() {
                return;
            }
            let Some(key) = answers.keys.get(&id) else {
                return;
            };
            if q.response_type == ResponseType::MultipleChoice {
                if let Some(ResponseConfig::MultipleChoice { options }) = &mut q.response_config {
                    if let Err(message) = mark_correct_option(options, &key.final_answer) {
                        outcome.warnings.push(MergeWarning {
                            question_number: q.question_number.clone(),
                            message,
                        });
                    }
                }
            }
            q.answer_key = Some(key.clone());
            outcome.merged += 1;
        });
    }
    debug!(
        "Merged {} answer keys ({} warnings)",
        outcome.merged,
        outcome.warnings.len()
    );
    outcome
}

/// Flag the single option matching `final_answer`.
///
/// Labels are compared in normalised form ("(B)", "b." and "B" agree). When
/// no label matches, an option whose text equals the answer is accepted.
/// Zero or several matches leave every flag false.
fn mark_correct_option(options: &mut [McqOption], final_answer: &str) -> Result<(), String> {
    for opt in options.iter_mut() {
        opt.is_correct = false;
    }

    let answer = normalize(final_answer);
    if answer.is_empty() {
        return Err("answer key has an empty final answer".to_string());
    }

    let mut hits: Vec<usize> = options
        .iter()
        .enumerate()
        .filter(|(_, o)| normalize(&o.label) == answer)
        .map(|(i, _)| i)
        .collect();
    if hits.is_empty() {
        let wanted = final_answer.trim().to_lowercase();
        hits = options
            .iter()
            .enumerate()
            .filter(|(_, o)| o.text.trim().to_lowercase() == wanted)
            .map(|(i, _)| i)
            .collect();
    }

    match hits.as_slice() {
        [only] => {
            options[*only].is_correct = true;
            Ok(())
        }
        [] => Err(format!("final answer '{final_answer}' matches no option")),
        many => Err(format!(
            "final answer '{final_answer}' matches {} options",
            many.len()
        )),
    }
}
