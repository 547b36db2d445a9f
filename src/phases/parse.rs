//! Phase 1: obtain the document's pages. The only phase that can fail a run.

use crate::error::ExtractionError;
use crate::model::PageContent;
use crate::pipeline::render::DocumentSource;
use tracing::info;

/// Parse `document` into pages in page-index order.
///
/// # Errors
/// Whatever the source raised, or [`ExtractionError::NoPages`] when it
/// produced nothing.
pub async fn run(source: &dyn DocumentSource, document: &str) -> Result<Vec<PageContent>, ExtractionError> {
    let mut pages = source.parse(document).await?;
    if pages.is_empty() {
        return Err(ExtractionError::NoPages {
            document: document.to_string(),
        });
    }
    pages.sort_by_key(|p| p.index);
    info!("Parsed {} pages from {}", pages.len(), document);
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::DynamicImage;

    struct Fixed(Vec<usize>);

    #[async_trait]
    impl DocumentSource for Fixed {
        async fn parse(&self, _document: &str) -> Result<Vec<PageContent>, ExtractionError> {
            Ok(self
                .0
                .iter()
                .map(|&i| PageContent::new(i, format!("page {i}"), DynamicImage::new_rgb8(10, 10)))
                .collect())
        }
    }

    #[tokio::test]
    async fn pages_come_back_in_index_order() {
        let pages = run(&Fixed(vec![2, 0, 1]), "paper.pdf").await.unwrap();
        let order: Vec<_> = pages.iter().map(|p| p.index).collect();
        assert_eq!(order, [0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_document_is_fatal() {
        let err = run(&Fixed(vec![]), "empty.pdf").await.unwrap_err();
        assert!(matches!(err, ExtractionError::NoPages { .. }));
    }
}
