use std::path::Path;

use mupdf::{Document, TextPageFlags};

use reportsft_core::{BackendError, PdfBackend};

/// MuPDF-based implementation of [`PdfBackend`].
///
/// This crate isolates the mupdf dependency (AGPL-3.0) so the rest of the
/// workspace can be built and tested without it.
///
/// Each MuPDF text block becomes one paragraph: its lines are joined with
/// `\n` and blocks are separated by a blank line, which is the boundary
/// [`reportsft_core::text::split_paragraphs`] splits on.
///
/// Header/footer exclusion is off by default. Running heads in annual
/// reports are short and are normally dropped by the minimum word count.
#[derive(Debug, Default, Clone)]
pub struct MupdfBackend {
    /// Fraction of page height from bottom to exclude as footer (0.0–1.0).
    footer_exclusion_ratio: Option<f32>,
    /// Fraction of page height from top to exclude as header (0.0–1.0).
    header_exclusion_ratio: Option<f32>,
}

impl MupdfBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the footer exclusion ratio. Pass `0.0` to disable.
    pub fn with_footer_exclusion(mut self, ratio: f32) -> Self {
        self.footer_exclusion_ratio = (ratio > 0.0).then_some(ratio);
        self
    }

    /// Set the header exclusion ratio. Pass `0.0` to disable.
    pub fn with_header_exclusion(mut self, ratio: f32) -> Self {
        self.header_exclusion_ratio = (ratio > 0.0).then_some(ratio);
        self
    }
}

/// Vertical band of a page whose blocks are kept.
#[derive(Debug, Clone, Copy)]
struct BodyBand {
    header_threshold: Option<f32>,
    footer_threshold: Option<f32>,
}

impl BodyBand {
    fn new(y0: f32, y1: f32, header_ratio: Option<f32>, footer_ratio: Option<f32>) -> Self {
        let height = y1 - y0;
        Self {
            header_threshold: header_ratio.map(|r| y0 + height * r),
            footer_threshold: footer_ratio.map(|r| y1 - height * r),
        }
    }

    /// Blocks entirely inside the header, or starting inside the footer, are dropped.
    fn contains(&self, block_y0: f32, block_y1: f32) -> bool {
        if let Some(t) = self.header_threshold
            && block_y1 <= t
        {
            return false;
        }
        if let Some(t) = self.footer_threshold
            && block_y0 >= t
        {
            return false;
        }
        true
    }
}

/// Join per-page blocks: lines within a block by `\n`, blocks and pages by a blank line.
fn assemble(pages: &[Vec<String>]) -> String {
    pages
        .iter()
        .flatten()
        .map(|b| b.trim_end_matches('\n'))
        .filter(|b| !b.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl PdfBackend for MupdfBackend {
    fn extract_text(&self, path: &Path) -> Result<String, BackendError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| BackendError::OpenError("invalid path encoding".into()))?;

        let document =
            Document::open(path_str).map_err(|e| BackendError::OpenError(e.to_string()))?;

        let mut pages = Vec::new();

        for page_result in document
            .pages()
            .map_err(|e| BackendError::ExtractionError(e.to_string()))?
        {
            let page = page_result.map_err(|e| BackendError::ExtractionError(e.to_string()))?;
            let text_page = page
                .to_text_page(TextPageFlags::empty())
                .map_err(|e| BackendError::ExtractionError(e.to_string()))?;
            let bounds = page
                .bounds()
                .map_err(|e| BackendError::ExtractionError(e.to_string()))?;
            let band = BodyBand::new(
                bounds.y0,
                bounds.y1,
                self.header_exclusion_ratio,
                self.footer_exclusion_ratio,
            );

            let mut blocks = Vec::new();
            for block in text_page.blocks() {
                let block_bounds = block.bounds();
                if !band.contains(block_bounds.y0, block_bounds.y1) {
                    continue;
                }
                let lines: Vec<String> = block
                    .lines()
                    .map(|line| {
                        line.chars()
                            .map(|c| c.char().unwrap_or('\u{FFFD}'))
                            .collect()
                    })
                    .collect();
                blocks.push(lines.join("\n"));
            }
            pages.push(blocks);
        }

        tracing::debug!(path = %path.display(), pages = pages.len(), "extracted text");
        Ok(assemble(&pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_and_pages_become_paragraphs() {
        let pages = vec![
            vec!["Line one\nline two".to_string(), "Second block".to_string()],
            vec![],
            vec!["  ".to_string(), "Next page".to_string()],
        ];
        assert_eq!(
            assemble(&pages),
            "Line one\nline two\n\nSecond block\n\nNext page"
        );
    }

    #[test]
    fn body_band_disabled_keeps_everything() {
        let band = BodyBand::new(0.0, 800.0, None, None);
        assert!(band.contains(0.0, 10.0));
        assert!(band.contains(790.0, 800.0));
    }

    #[test]
    fn body_band_drops_header_and_footer_blocks() {
        let band = BodyBand::new(0.0, 1000.0, Some(0.04), Some(0.05));
        // Entirely in the top 40pt.
        assert!(!band.contains(5.0, 30.0));
        // Straddles the header line.
        assert!(band.contains(30.0, 60.0));
        // Starts in the bottom 50pt.
        assert!(!band.contains(960.0, 990.0));
        assert!(band.contains(500.0, 520.0));
    }

    #[test]
    fn builders_treat_zero_as_disabled() {
        let b = MupdfBackend::new()
            .with_header_exclusion(0.0)
            .with_footer_exclusion(0.05);
        assert!(b.header_exclusion_ratio.is_none());
        assert_eq!(b.footer_exclusion_ratio, Some(0.05));
    }

    #[test]
    fn missing_file_is_open_error() {
        let err = MupdfBackend::new()
            .extract_text(Path::new("/nonexistent/report.pdf"))
            .unwrap_err();
        assert!(matches!(err, BackendError::OpenError(_)));
    }
}
