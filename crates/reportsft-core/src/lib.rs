use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod alpaca;
pub mod backend;
pub mod config_file;
pub mod dataset;
pub mod export;
pub mod llm;
pub mod ollama;
pub mod persist;
pub mod pipeline;
pub mod rate_limit;
pub mod text;
pub mod tracker;

// Re-export for convenience
pub use backend::{BackendError, PdfBackend};
pub use dataset::{DatasetEntry, DatasetStore};
pub use llm::{GenerationError, ParagraphRequest, QaGenerator, QaPair, Verdict};
pub use persist::StateError;
pub use pipeline::{ReportStatus, ResetOutcome, discover_reports, report_status, reset_report};
pub use rate_limit::{AdaptiveLimiter, RetryPolicy};
pub use tracker::{FileStatus, Tracker};

pub const DEFAULT_REPORTS_DIR: &str = "Reports";
pub const DEFAULT_TRACKER_PATH: &str = "tracker.json";
pub const DEFAULT_DATASET_PATH: &str = "dataset.json";
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 5;

/// Settings for a dataset generation run.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub reports_dir: PathBuf,
    pub tracker_path: PathBuf,
    pub dataset_path: PathBuf,
    /// Preceding paragraphs sent along with each target paragraph.
    pub context_paragraphs: usize,
    /// Paragraphs with this many words or fewer are dropped.
    pub min_words: usize,
    /// Processed paragraphs between two checkpoints.
    pub checkpoint_interval: usize,
    pub retry: RetryPolicy,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            reports_dir: PathBuf::from(DEFAULT_REPORTS_DIR),
            tracker_path: PathBuf::from(DEFAULT_TRACKER_PATH),
            dataset_path: PathBuf::from(DEFAULT_DATASET_PATH),
            context_paragraphs: text::DEFAULT_CONTEXT_PARAGRAPHS,
            min_words: text::DEFAULT_MIN_WORDS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to a single paragraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParagraphOutcome {
    /// A new entry was added to the dataset.
    Accepted,
    /// Accepted, but the dataset already held an entry for this paragraph.
    Duplicate,
    /// The model judged the paragraph not worth an example.
    Rejected,
    /// The response was blocked or unusable; the paragraph was skipped.
    Skipped { reason: String },
}

/// Progress events emitted during a generation run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Discovered {
        total: usize,
    },
    /// Already marked completed in the tracker.
    FileSkipped {
        file: String,
    },
    FileStarted {
        file: String,
        total_paragraphs: usize,
        resume_from: usize,
    },
    ParagraphDone {
        file: String,
        index: usize,
        total: usize,
        outcome: ParagraphOutcome,
    },
    /// Dataset flushed and tracker advanced to `paragraph_index`.
    Checkpoint {
        file: String,
        paragraph_index: usize,
        dataset_len: usize,
    },
    RateLimitWait {
        file: String,
        index: usize,
        attempt: u32,
        wait: Duration,
        reason: String,
    },
    FileFinished {
        file: String,
        entries_added: usize,
    },
    FileFailed {
        file: String,
        error: String,
    },
}

/// Summary statistics for a generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub files_total: usize,
    pub files_completed: usize,
    pub files_skipped: usize,
    pub paragraphs_processed: usize,
    pub entries_added: usize,
    pub rejected: usize,
    /// Blocked or unparseable responses.
    pub malformed: usize,
    pub cancelled: bool,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("reports directory not found: {}", .0.display())]
    ReportsDirMissing(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to extract text from {file}: {source}")]
    Extraction {
        file: String,
        #[source]
        source: BackendError,
    },
    #[error("generation failed for {file} paragraph {index}: {source}")]
    Generation {
        file: String,
        index: usize,
        #[source]
        source: GenerationError,
    },
    #[error("background task failed: {0}")]
    Task(String),
}

/// Generate Q&A entries for every report in `settings.reports_dir`.
///
/// Reports are processed in file-name order, one paragraph at a time, under
/// `limiter`. Progress is checkpointed to the tracker after the dataset has
/// been flushed, so an interrupted run resumes where it stopped without
/// duplicating entries. Cancelling `cancel` checkpoints and returns a summary
/// with `cancelled` set.
pub async fn run_generation(
    settings: &GenerationSettings,
    backend: Arc<dyn PdfBackend>,
    generator: &dyn QaGenerator,
    limiter: &AdaptiveLimiter,
    progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<RunSummary, CoreError> {
    pipeline::run_generation(settings, backend, generator, limiter, progress, cancel).await
}
