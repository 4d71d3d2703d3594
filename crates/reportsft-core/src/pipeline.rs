//! Resumable dataset generation over a directory of reports.
//!
//! Ordering rule: the dataset is flushed before the tracker is advanced, so a
//! tracker index never points past paragraphs that have reached the dataset
//! file. On resume the dataset's highest stored index is also consulted,
//! which covers a crash between those two writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::dataset::{DatasetEntry, DatasetStore};
use crate::llm::{ParagraphRequest, QaGenerator, Verdict};
use crate::rate_limit::{AdaptiveLimiter, RetryWait, generate_with_retry};
use crate::text::{context_window, split_paragraphs};
use crate::tracker::{FileStatus, Tracker};
use crate::{
    CoreError, GenerationSettings, ParagraphOutcome, PdfBackend, ProgressEvent, RunSummary,
    StateError,
};

/// List the `.pdf` files (any extension case) in `dir`, sorted by file name.
pub fn discover_reports(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    if !dir.is_dir() {
        return Err(CoreError::ReportsDirMissing(dir.to_path_buf()));
    }
    let io_err = |source| CoreError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// How processing of one report ended.
enum FileEnd {
    Finished,
    Cancelled,
}

struct Run<'a> {
    settings: &'a GenerationSettings,
    backend: Arc<dyn PdfBackend>,
    generator: &'a dyn QaGenerator,
    limiter: &'a AdaptiveLimiter,
    progress: &'a (dyn Fn(ProgressEvent) + Send + Sync),
    cancel: &'a CancellationToken,
    tracker: Tracker,
    dataset: DatasetStore,
    summary: RunSummary,
}

pub(crate) async fn run_generation(
    settings: &GenerationSettings,
    backend: Arc<dyn PdfBackend>,
    generator: &dyn QaGenerator,
    limiter: &AdaptiveLimiter,
    progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<RunSummary, CoreError> {
    let tracker = Tracker::load(&settings.tracker_path)?;
    let dataset = DatasetStore::load(&settings.dataset_path)?;
    let files = discover_reports(&settings.reports_dir)?;

    tracing::info!(
        reports = files.len(),
        dataset_entries = dataset.len(),
        generator = generator.name(),
        "starting generation run"
    );
    progress(ProgressEvent::Discovered { total: files.len() });

    let mut run = Run {
        settings,
        backend,
        generator,
        limiter,
        progress,
        cancel,
        tracker,
        dataset,
        summary: RunSummary {
            files_total: files.len(),
            ..Default::default()
        },
    };

    for path in &files {
        if cancel.is_cancelled() {
            run.summary.cancelled = true;
            break;
        }

        let file = file_label(path);
        if run.tracker.file_status(&file).completed {
            tracing::debug!(file = %file, "already completed, skipping");
            run.summary.files_skipped += 1;
            progress(ProgressEvent::FileSkipped { file });
            continue;
        }

        match run.process_file(path, &file).await {
            Ok(FileEnd::Finished) => run.summary.files_completed += 1,
            Ok(FileEnd::Cancelled) => {
                tracing::info!(file = %file, "run cancelled");
                run.summary.cancelled = true;
                break;
            }
            Err(e) => {
                tracing::error!(file = %file, error = %e, "stopping run");
                progress(ProgressEvent::FileFailed {
                    file,
                    error: e.to_string(),
                });
                return Err(e);
            }
        }
    }

    Ok(run.summary)
}

impl Run<'_> {
    async fn extract(&self, path: &Path, file: &str) -> Result<String, CoreError> {
        let backend = Arc::clone(&self.backend);
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || backend.extract_text(&owned))
            .await
            .map_err(|e| CoreError::Task(e.to_string()))?
            .map_err(|source| CoreError::Extraction {
                file: file.to_string(),
                source,
            })
    }

    async fn process_file(&mut self, path: &Path, file: &str) -> Result<FileEnd, CoreError> {
        let text = self.extract(path, file).await?;
        let paragraphs = split_paragraphs(&text, self.settings.min_words);
        let total = paragraphs.len();

        let status = self.tracker.file_status(file);
        let after_stored = self.dataset.last_index_for(file).map_or(0, |i| i + 1);
        let resume_from = status.paragraph_index.max(after_stored).min(total);

        tracing::info!(file = %file, paragraphs = total, resume_from, "processing report");
        (self.progress)(ProgressEvent::FileStarted {
            file: file.to_string(),
            total_paragraphs: total,
            resume_from,
        });

        let interval = self.settings.checkpoint_interval.max(1);
        let mut since_checkpoint = 0usize;
        let mut added = 0usize;

        for index in resume_from..total {
            let request = ParagraphRequest {
                context: context_window(&paragraphs, index, self.settings.context_paragraphs),
                target: &paragraphs[index],
            };
            let progress = self.progress;
            let on_wait = |w: &RetryWait| {
                progress(ProgressEvent::RateLimitWait {
                    file: file.to_string(),
                    index,
                    attempt: w.attempt,
                    wait: w.wait,
                    reason: w.error.to_string(),
                })
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = generate_with_retry(
                    self.generator,
                    request,
                    self.limiter,
                    &self.settings.retry,
                    &on_wait,
                ) => Some(r),
            };

            let outcome = match result {
                None => {
                    self.checkpoint(file, index)?;
                    return Ok(FileEnd::Cancelled);
                }
                Some(Ok(Verdict::Accepted(pair))) => {
                    let entry = DatasetEntry {
                        file: file.to_string(),
                        paragraph_index: index,
                        question: pair.question,
                        answer: pair.answer,
                    };
                    if self.dataset.push(entry) {
                        added += 1;
                        self.summary.entries_added += 1;
                        ParagraphOutcome::Accepted
                    } else {
                        ParagraphOutcome::Duplicate
                    }
                }
                Some(Ok(Verdict::Rejected)) => {
                    self.summary.rejected += 1;
                    ParagraphOutcome::Rejected
                }
                Some(Err(e)) if e.is_content_error() => {
                    tracing::warn!(file = %file, index, error = %e, "skipping paragraph");
                    self.summary.malformed += 1;
                    ParagraphOutcome::Skipped {
                        reason: e.to_string(),
                    }
                }
                Some(Err(source)) => {
                    if let Err(ce) = self.checkpoint(file, index) {
                        tracing::error!(file = %file, error = %ce, "checkpoint after failure failed");
                    }
                    return Err(CoreError::Generation {
                        file: file.to_string(),
                        index,
                        source,
                    });
                }
            };

            self.summary.paragraphs_processed += 1;
            (self.progress)(ProgressEvent::ParagraphDone {
                file: file.to_string(),
                index,
                total,
                outcome,
            });

            since_checkpoint += 1;
            if since_checkpoint >= interval && index + 1 < total {
                since_checkpoint = 0;
                self.checkpoint(file, index + 1)?;
                (self.progress)(ProgressEvent::Checkpoint {
                    file: file.to_string(),
                    paragraph_index: index + 1,
                    dataset_len: self.dataset.len(),
                });
            }
        }

        self.dataset.save()?;
        self.tracker.update_file_status(file, total, true)?;
        tracing::info!(file = %file, entries_added = added, "report finished");
        (self.progress)(ProgressEvent::FileFinished {
            file: file.to_string(),
            entries_added: added,
        });
        Ok(FileEnd::Finished)
    }

    /// Flush the dataset, then record `next_index` as the first unprocessed paragraph.
    fn checkpoint(&mut self, file: &str, next_index: usize) -> Result<(), StateError> {
        if self.dataset.is_dirty() {
            self.dataset.save()?;
        }
        if next_index > self.tracker.file_status(file).paragraph_index {
            self.tracker.update_file_status(file, next_index, false)?;
        }
        tracing::debug!(file = %file, next_index, "checkpoint");
        Ok(())
    }
}

/// Progress of one report, combining the tracker with the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportStatus {
    pub file: String,
    pub status: FileStatus,
    /// Entries in the dataset generated from this report.
    pub entries: usize,
    /// Whether the PDF is still present in the reports directory.
    pub on_disk: bool,
}

/// Status of every report known to the tracker or the dataset, or present on
/// disk, by file name.
pub fn report_status(settings: &GenerationSettings) -> Result<Vec<ReportStatus>, CoreError> {
    let tracker = Tracker::load(&settings.tracker_path)?;
    let dataset = DatasetStore::load(&settings.dataset_path)?;
    let counts = dataset.counts_by_file();

    let on_disk: Vec<String> = match discover_reports(&settings.reports_dir) {
        Ok(files) => files.iter().map(|p| file_label(p)).collect(),
        Err(CoreError::ReportsDirMissing(_)) => Vec::new(),
        Err(e) => return Err(e),
    };

    let mut rows: HashMap<String, ReportStatus> = HashMap::new();
    for (file, status) in tracker.iter() {
        rows.insert(
            file.to_string(),
            ReportStatus {
                file: file.to_string(),
                status: *status,
                entries: counts.get(file).copied().unwrap_or(0),
                on_disk: false,
            },
        );
    }
    for file in on_disk {
        rows.entry(file.clone())
            .or_insert_with(|| ReportStatus {
                file: file.clone(),
                status: FileStatus::default(),
                entries: counts.get(file.as_str()).copied().unwrap_or(0),
                on_disk: true,
            })
            .on_disk = true;
    }
    for (file, entries) in &counts {
        rows.entry(file.to_string()).or_insert_with(|| ReportStatus {
            file: file.to_string(),
            status: FileStatus::default(),
            entries: *entries,
            on_disk: false,
        });
    }

    let mut rows: Vec<ReportStatus> = rows.into_values().collect();
    rows.sort_by(|a, b| a.file.cmp(&b.file));
    Ok(rows)
}

/// What [`reset_report`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub tracker_entry: bool,
    pub dataset_entries: usize,
}

/// Forget all progress for `file` so the next run regenerates it from the
/// first paragraph.
///
/// The tracker entry goes first: if the dataset write then fails, the stale
/// entries only move the resume point forward, never past missing data.
pub fn reset_report(settings: &GenerationSettings, file: &str) -> Result<ResetOutcome, CoreError> {
    let mut tracker = Tracker::load(&settings.tracker_path)?;
    let mut dataset = DatasetStore::load(&settings.dataset_path)?;

    let tracker_entry = tracker.remove(file)?;
    let dataset_entries = dataset.remove_file(file);
    if dataset_entries > 0 {
        dataset.save()?;
    }
    tracing::info!(file, tracker_entry, dataset_entries, "reset report");
    Ok(ResetOutcome {
        tracker_entry,
        dataset_entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_removes_tracker_and_dataset_entries() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GenerationSettings {
            reports_dir: dir.path().join("Reports"),
            tracker_path: dir.path().join("tracker.json"),
            dataset_path: dir.path().join("dataset.json"),
            ..Default::default()
        };
        let mut tracker = Tracker::load(&settings.tracker_path).unwrap();
        tracker.update_file_status("a.pdf", 2, true).unwrap();
        tracker.update_file_status("b.pdf", 1, false).unwrap();
        let mut dataset = DatasetStore::load(&settings.dataset_path).unwrap();
        for (file, i) in [("a.pdf", 0), ("a.pdf", 1), ("b.pdf", 0)] {
            dataset.push(DatasetEntry {
                file: file.into(),
                paragraph_index: i,
                question: "Q?".into(),
                answer: "A".into(),
            });
        }
        dataset.save().unwrap();

        let outcome = reset_report(&settings, "a.pdf").unwrap();
        assert_eq!(
            outcome,
            ResetOutcome {
                tracker_entry: true,
                dataset_entries: 2
            }
        );

        let tracker = Tracker::load(&settings.tracker_path).unwrap();
        assert_eq!(tracker.file_status("a.pdf"), FileStatus::default());
        assert_eq!(tracker.file_status("b.pdf").paragraph_index, 1);
        let dataset = DatasetStore::load(&settings.dataset_path).unwrap();
        assert_eq!(dataset.len(), 1);

        let again = reset_report(&settings, "a.pdf").unwrap();
        assert!(!again.tracker_entry);
        assert_eq!(again.dataset_entries, 0);
    }

    #[test]
    fn discover_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pdf", "A.PDF", "notes.txt", "c.Pdf"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.pdf")).unwrap();

        let names: Vec<String> = discover_reports(dir.path())
            .unwrap()
            .iter()
            .map(|p| file_label(p))
            .collect();
        assert_eq!(names, vec!["A.PDF", "b.pdf", "c.Pdf"]);
    }

    #[test]
    fn discover_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_reports(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, CoreError::ReportsDirMissing(_)));
    }

    #[test]
    fn report_status_merges_tracker_dataset_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("Reports");
        std::fs::create_dir(&reports).unwrap();
        std::fs::write(reports.join("new.pdf"), b"").unwrap();
        std::fs::write(reports.join("half.pdf"), b"").unwrap();

        let settings = GenerationSettings {
            reports_dir: reports,
            tracker_path: dir.path().join("tracker.json"),
            dataset_path: dir.path().join("dataset.json"),
            ..Default::default()
        };

        let mut tracker = Tracker::load(&settings.tracker_path).unwrap();
        tracker.update_file_status("half.pdf", 3, false).unwrap();
        tracker.update_file_status("gone.pdf", 9, true).unwrap();

        let mut dataset = DatasetStore::load(&settings.dataset_path).unwrap();
        for i in 0..2 {
            dataset.push(DatasetEntry {
                file: "half.pdf".into(),
                paragraph_index: i,
                question: "Q?".into(),
                answer: "A".into(),
            });
        }
        dataset.save().unwrap();

        let rows = report_status(&settings).unwrap();
        let files: Vec<&str> = rows.iter().map(|r| r.file.as_str()).collect();
        assert_eq!(files, vec!["gone.pdf", "half.pdf", "new.pdf"]);

        assert!(!rows[0].on_disk);
        assert!(rows[0].status.completed);
        assert_eq!(rows[1].entries, 2);
        assert_eq!(rows[1].status.paragraph_index, 3);
        assert!(rows[1].on_disk);
        assert_eq!(rows[2].status, FileStatus::default());
    }

    #[test]
    fn report_status_lists_dataset_only_reports() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GenerationSettings {
            reports_dir: dir.path().join("Reports"),
            tracker_path: dir.path().join("tracker.json"),
            dataset_path: dir.path().join("dataset.json"),
            ..Default::default()
        };

        let mut dataset = DatasetStore::load(&settings.dataset_path).unwrap();
        for i in 0..3 {
            dataset.push(DatasetEntry {
                file: "orphan.pdf".into(),
                paragraph_index: i,
                question: "Q?".into(),
                answer: "A".into(),
            });
        }
        dataset.save().unwrap();

        let rows = report_status(&settings).unwrap();
        assert_eq!(
            rows,
            vec![ReportStatus {
                file: "orphan.pdf".into(),
                status: FileStatus::default(),
                entries: 3,
                on_disk: false,
            }]
        );
        assert_eq!(rows.iter().map(|r| r.entries).sum::<usize>(), dataset.len());
    }
}
