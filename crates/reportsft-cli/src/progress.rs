use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reportsft_core::ProgressEvent;

use crate::output::{self, ColorMode};

/// Two stacked bars: reports done, and paragraphs of the current report.
pub struct GenerationProgress {
    multi: MultiProgress,
    files: ProgressBar,
    paragraphs: ProgressBar,
    color: ColorMode,
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .map(|s| s.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl GenerationProgress {
    pub fn new(color: ColorMode) -> Self {
        let multi = MultiProgress::new();

        let files = multi.add(ProgressBar::new(0));
        files.set_style(bar_style(
            "{spinner:.cyan} Reports    [{bar:40.cyan/dim}] {pos}/{len}",
        ));
        files.enable_steady_tick(Duration::from_millis(120));

        let paragraphs = multi.add(ProgressBar::new(0));
        paragraphs.set_style(bar_style(
            "{spinner:.green} {msg:<12.12} [{bar:40.green/dim}] {pos}/{len} (eta {eta})",
        ));

        Self {
            multi,
            files,
            paragraphs,
            color,
        }
    }

    pub fn handle(&self, event: &ProgressEvent) {
        if let Some(line) = output::event_line(event, self.color) {
            let _ = self.multi.println(line);
        }

        match event {
            ProgressEvent::Discovered { total } => self.files.set_length(*total as u64),
            ProgressEvent::FileSkipped { .. } | ProgressEvent::FileFinished { .. } => {
                self.files.inc(1)
            }
            ProgressEvent::FileStarted {
                file,
                total_paragraphs,
                resume_from,
            } => {
                self.paragraphs.reset();
                self.paragraphs.set_length(*total_paragraphs as u64);
                self.paragraphs.set_position(*resume_from as u64);
                self.paragraphs.set_message(file.clone());
            }
            ProgressEvent::ParagraphDone { index, .. } => {
                self.paragraphs.set_position(*index as u64 + 1)
            }
            ProgressEvent::Checkpoint {
                paragraph_index, ..
            } => {
                tracing::debug!(paragraph_index, "checkpoint written");
            }
            ProgressEvent::RateLimitWait { .. } | ProgressEvent::FileFailed { .. } => {}
        }
    }

    pub fn finish(&self) {
        self.paragraphs.finish_and_clear();
        self.files.finish_and_clear();
    }
}
