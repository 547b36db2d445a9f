//! Diagram linking: turn a page's diagram descriptors into materialised
//! [`Diagram`]s attached to the right question nodes, without model calls.
//!
//! ## Resolution order
//!
//! For each descriptor, with `n = normalize(associated_question)`:
//!
//! 1. exactly one question on the page has number `n` → attach there
//! 2. several do → nearest of those by vertical band
//! 3. none do, but a question on another page has `n` → attach to that
//!    question (the canonical owner) *and* to the nearest question on this
//!    page; both copies are flagged shared
//! 4. no match anywhere → nearest question on the page by vertical band
//! 5. the page has no questions → drop with a non-fatal error
//!
//! Band distance compares the descriptor's vertical centre band with each
//! question's recorded band; ties go to the earliest question in pre-order.
//!
//! A descriptor with no box, a box that clamps to zero area, or a crop the
//! [`Cropper`] rejects is dropped with [`PageError::DiagramDropped`]; the
//! remaining descriptors are unaffected.

use crate::error::PageError;
use crate::geometry::{to_pixel_rect, to_storage_scale, Band, Rect, Scale, STORAGE_MAX};
use crate::identifier::normalize;
use crate::model::{find_in_forest_mut, flatten, Diagram, DiagramDescriptor, PageContent, Question};
use crate::pipeline::crop::{CropKey, Cropper};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

// ── Question index ───────────────────────────────────────────────────────

/// Where a question lives, for cross-page lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionRef {
    pub page_index: usize,
    pub question_id: String,
    pub question_number: String,
}

/// Normalised question number → every node carrying it, in paper order.
#[derive(Debug, Clone, Default)]
pub struct QuestionIndex {
    by_number: HashMap<String, Vec<QuestionRef>>,
}

impl QuestionIndex {
    /// Index every node of the given roots (subparts included). Pass roots
    /// in page order so the first entry per number is the earliest.
    pub fn build<'a>(roots: impl IntoIterator<Item = &'a Question>) -> Self {
        let mut by_number: HashMap<String, Vec<QuestionRef>> = HashMap::new();
        for root in roots {
            let mut nodes = Vec::new();
            root.walk(&mut nodes);
            for q in nodes {
                let key = normalize(&q.question_number);
                if key.is_empty() {
                    continue;
                }
                by_number.entry(key).or_default().push(QuestionRef {
                    page_index: q.source.page_index,
                    question_id: q.id.clone(),
                    question_number: q.question_number.clone(),
                });
            }
        }
        Self { by_number }
    }

    pub fn lookup(&self, normalized: &str) -> &[QuestionRef] {
        self.by_number.get(normalized).map_or(&[], Vec::as_slice)
    }
}

// ── Linker ───────────────────────────────────────────────────────────────

/// A diagram that belongs to a question on another page. The diagrams
/// phase attaches it once every page has been linked.
#[derive(Debug, Clone)]
pub struct ForeignAttachment {
    pub question_id: String,
    pub diagram: Diagram,
}

/// Result of linking one page.
#[derive(Debug, Clone, Default)]
pub struct PageLinkOutput {
    pub questions: Vec<Question>,
    pub foreign: Vec<ForeignAttachment>,
    pub errors: Vec<PageError>,
    /// Descriptors that produced a diagram.
    pub linked: usize,
}

#[derive(Clone)]
pub struct DiagramLinker {
    cropper: Arc<dyn Cropper>,
    inference_scale: f64,
    padding_px: u32,
    default_confidence: f64,
}

enum Target {
    Local(String),
    Shared { owner: QuestionRef, local: Option<String> },
}

impl DiagramLinker {
    pub fn new(
        cropper: Arc<dyn Cropper>,
        inference_scale: f64,
        padding_px: u32,
        default_confidence: f64,
    ) -> Self {
        Self {
            cropper,
            inference_scale,
            padding_px,
            default_confidence,
        }
    }

    /// Link one page's descriptors against that page's question forest.
    ///
    /// Pure with respect to the page: the only side effect is the crop
    /// primitive storing images.
    pub fn link_page(
        &self,
        page: &PageContent,
        mut questions: Vec<Question>,
        descriptors: Vec<DiagramDescriptor>,
        index: &QuestionIndex,
    ) -> PageLinkOutput {
        let mut out = PageLinkOutput::default();
        let dropped = |detail: String| PageError::DiagramDropped {
            page: page.number(),
            detail,
        };

        for desc in descriptors {
            let Some(rect) = desc.rect else {
                out.errors.push(dropped(format!(
                    "diagram for question '{}' has no bounding box",
                    desc.associated_question
                )));
                continue;
            };
            let storage = match rect.scale {
                Scale::Inference => to_storage_scale(&rect, self.inference_scale),
                Scale::Storage => to_storage_scale(&rect, STORAGE_MAX),
            };
            if storage.width() <= 0.0 || storage.height() <= 0.0 {
                out.errors.push(dropped(format!("bounding box {rect} clamps to zero area")));
                continue;
            }

            let Some(target) = resolve_target(&questions, page.index, &desc, &storage, index) else {
                out.errors.push(dropped(format!(
                    "no question on the page to attach diagram '{}'",
                    desc.description
                )));
                continue;
            };

            let (owner_id, owner_number) = match &target {
                Target::Local(id) => (id.clone(), number_of(&questions, id)),
                Target::Shared { owner, .. } => (owner.question_id.clone(), owner.question_number.clone()),
            };

            let id = Uuid::new_v4().to_string();
            let pixels = to_pixel_rect(&storage, page.width, page.height, self.padding_px);
            let image = match self.cropper.crop(page, pixels, &CropKey::new(owner_number, id.as_str())) {
                Ok(image) => image,
                Err(e) => {
                    out.errors.push(dropped(e.to_string()));
                    continue;
                }
            };

            let mut diagram = Diagram {
                id,
                diagram_type: desc.diagram_type,
                description: desc.description,
                rect: storage,
                source_page: page.index,
                image,
                confidence: desc
                    .confidence
                    .filter(|c| c.is_finite())
                    .unwrap_or(self.default_confidence)
                    .clamp(0.0, 1.0),
                is_shared: false,
                shared_with_questions: Vec::new(),
            };

            match target {
                Target::Local(qid) => {
                    debug!("Page {}: diagram {} → question {}", page.number(), diagram.id, qid);
                    attach(&mut questions, &qid, diagram);
                }
                Target::Shared { owner, local } => {
                    diagram.is_shared = true;
                    diagram.shared_with_questions.push(owner_id.clone());
                    if let Some(local_id) = local {
                        diagram.shared_with_questions.push(local_id.clone());
                        attach(&mut questions, &local_id, diagram.clone());
                    }
                    debug!(
                        "Page {}: diagram {} shared with question {} on page {}",
                        page.number(),
                        diagram.id,
                        owner.question_number,
                        owner.page_index + 1
                    );
                    out.foreign.push(ForeignAttachment {
                        question_id: owner.question_id,
                        diagram,
                    });
                }
            }
            out.linked += 1;
        }

        out.questions = questions;
        out
    }
}

fn resolve_target(
    questions: &[Question],
    page_index: usize,
    desc: &DiagramDescriptor,
    storage: &Rect,
    index: &QuestionIndex,
) -> Option<Target> {
    let nodes = flatten(questions);
    let band = Band::from_storage_y(storage.center_y());
    let wanted = normalize(&desc.associated_question);

    if !wanted.is_empty() {
        let local: Vec<&Question> = nodes
            .iter()
            .copied()
            .filter(|q| normalize(&q.question_number) == wanted)
            .collect();
        if let Some(q) = nearest(&local, band) {
            return Some(Target::Local(q.id.clone()));
        }

        if let Some(owner) = index.lookup(&wanted).iter().find(|r| r.page_index != page_index) {
            return Some(Target::Shared {
                owner: owner.clone(),
                local: nearest(&nodes, band).map(|q| q.id.clone()),
            });
        }
    }

    nearest(&nodes, band).map(|q| Target::Local(q.id.clone()))
}

/// Closest question by band distance; the first in pre-order wins ties.
fn nearest<'a>(candidates: &[&'a Question], band: Band) -> Option<&'a Question> {
    candidates
        .iter()
        .copied()
        .min_by_key(|q| q.source.band.distance(band))
}

fn number_of(questions: &[Question], id: &str) -> String {
    flatten(questions)
        .into_iter()
        .find(|q| q.id == id)
        .map(|q| q.question_number.clone())
        .unwrap_or_default()
}

fn attach(questions: &mut [Question], question_id: &str, diagram: Diagram) {
    if let Some(q) = find_in_forest_mut(questions, question_id) {
        q.diagrams.push(diagram);
    }
}

// ── Cross-page sharing ───────────────────────────────────────────────────

/// Flag diagrams that cross page or question boundaries.
///
/// Run once over the whole forest after foreign attachments are applied. A
/// diagram copy is shared when its id is held by more than one question,
/// or when its holder collects diagrams from more than one page. Every copy
/// of an id ends up with the same `shared_with_questions`, owner first.
pub fn mark_cross_page_sharing(forest: &mut [Question]) {
    let mut holders: HashMap<String, Vec<String>> = HashMap::new();
    let mut pages_per_question: HashMap<String, BTreeSet<usize>> = HashMap::new();

    for q in flatten(forest) {
        for d in &q.diagrams {
            let list = holders.entry(d.id.clone()).or_insert_with(|| d.shared_with_questions.clone());
            if !list.contains(&q.id) {
                list.push(q.id.clone());
            }
            pages_per_question
                .entry(q.id.clone())
                .or_default()
                .insert(d.source_page);
        }
    }

    for root in forest.iter_mut() {
        root.visit_mut(&mut |q: &mut Question| {
            let multi_page = pages_per_question.get(&q.id).is_some_and(|p| p.len() > 1);
            for d in &mut q.diagrams {
                let list = holders.get(&d.id).cloned().unwrap_or_default();
                if d.is_shared || multi_page || list.len() > 1 {
                    d.is_shared = true;
                    d.shared_with_questions = list;
                }
            }
        });
    }
}
