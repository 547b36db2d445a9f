//! Phase 3b: link each page's diagram descriptors to question nodes and
//! assemble the document forest.
//!
//! Linking is CPU-bound (cropping and PNG encoding), so every page with
//! descriptors runs on the blocking pool. Pages are linked independently
//! against their own forest; diagrams that belong to a question on another
//! page come back as foreign attachments and are applied once the forest is
//! assembled in page order.

use super::questions::PageQuestions;
use super::{PhaseContext, DIAGRAM_LINKER};
use crate::linker::{mark_cross_page_sharing, DiagramLinker, PageLinkOutput, QuestionIndex};
use crate::model::{find_in_forest_mut, PageContent, Phase, Question};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of the diagram phase.
#[derive(Debug, Clone, Default)]
pub struct LinkedForest {
    /// Every page's questions, in page order, with diagrams attached.
    pub questions: Vec<Question>,
    /// Descriptors that became diagrams.
    pub linked: usize,
}

/// Concatenate page forests without linking, for runs with diagrams off.
pub fn assemble(extracted: Vec<PageQuestions>) -> Vec<Question> {
    extracted.into_iter().flat_map(|p| p.questions).collect()
}

pub async fn run(ctx: &PhaseContext, pages: &[PageContent], extracted: Vec<PageQuestions>) -> LinkedForest {
    ctx.ledger.record_agent(DIAGRAM_LINKER);
    let total = pages.len();
    let config = &ctx.config;
    let linker = DiagramLinker::new(
        Arc::clone(&ctx.cropper),
        config.inference_scale,
        config.crop_padding_px,
        config.default_diagram_confidence,
    );
    let index = Arc::new(QuestionIndex::build(extracted.iter().flat_map(|p| p.questions.iter())));

    let mut outputs: Vec<(usize, PageLinkOutput)> = stream::iter(extracted.into_iter().map(|pq| {
        let page = pages.iter().find(|p| p.index == pq.page_index).cloned();
        let linker = linker.clone();
        let index = Arc::clone(&index);
        async move {
            let page_index = pq.page_index;
            let (Some(page), false) = (page, pq.descriptors.is_empty()) else {
                return (
                    page_index,
                    PageLinkOutput {
                        questions: pq.questions,
                        ..Default::default()
                    },
                );
            };

            let fallback = pq.questions.clone();
            let joined = tokio::task::spawn_blocking(move || {
                linker.link_page(&page, pq.questions, pq.descriptors, &index)
            })
            .await;
            match joined {
                Ok(out) => (page_index, out),
                Err(e) => {
                    warn!("Page {}: diagram linking task failed: {}", page_index + 1, e);
                    ctx.ledger.log_error(
                        DIAGRAM_LINKER,
                        Phase::Diagrams,
                        Some(page_index + 1),
                        format!("diagram linking task failed: {e}"),
                    );
                    (
                        page_index,
                        PageLinkOutput {
                            questions: fallback,
                            ..Default::default()
                        },
                    )
                }
            }
        }
    }))
    .buffer_unordered(config.concurrency.max(1))
    .collect()
    .await;

    outputs.sort_by_key(|(page_index, _)| *page_index);

    let mut forest = Vec::new();
    let mut foreign = Vec::new();
    let mut linked = 0;
    for (page_index, out) in outputs {
        for e in &out.errors {
            ctx.ledger.log_page_error(DIAGRAM_LINKER, Phase::Diagrams, e);
        }
        ctx.page_done(Phase::Diagrams, page_index + 1, total);
        linked += out.linked;
        forest.extend(out.questions);
        foreign.extend(out.foreign);
    }

    for attachment in foreign {
        match find_in_forest_mut(&mut forest, &attachment.question_id) {
            Some(q) => q.diagrams.push(attachment.diagram),
            None => warn!(
                "Shared diagram {} lost its owner question {}",
                attachment.diagram.id, attachment.question_id
            ),
        }
    }
    mark_cross_page_sharing(&mut forest);

    info!("Linked {} diagrams", linked);
    LinkedForest {
        questions: forest,
        linked,
    }
}
