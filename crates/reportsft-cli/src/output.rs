use std::io::Write;

use owo_colors::OwoColorize;
use reportsft_core::alpaca::PrepareReport;
use reportsft_core::export::ExportStep;
use reportsft_core::llm::ModelSummary;
use reportsft_core::{ParagraphOutcome, ProgressEvent, ReportStatus, ResetOutcome, RunSummary};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// One-line message for events worth keeping in the scrollback.
///
/// Per-paragraph events only move the progress bars and return `None`.
pub fn event_line(event: &ProgressEvent, color: ColorMode) -> Option<String> {
    match event {
        ProgressEvent::Discovered { total } => Some(format!("Found {} report(s)", total)),
        ProgressEvent::FileSkipped { file } => {
            let msg = format!("Skipping {} (already completed)", file);
            Some(if color.enabled() {
                msg.dimmed().to_string()
            } else {
                msg
            })
        }
        ProgressEvent::FileStarted {
            file,
            total_paragraphs,
            resume_from,
        } => Some(if *resume_from > 0 {
            format!(
                "Resuming {} at paragraph {} of {}",
                file,
                resume_from + 1,
                total_paragraphs
            )
        } else {
            format!("Processing {} ({} paragraphs)", file, total_paragraphs)
        }),
        ProgressEvent::ParagraphDone {
            outcome: ParagraphOutcome::Skipped { reason },
            file,
            index,
            ..
        } => {
            let msg = format!("  {} paragraph {} skipped: {}", file, index + 1, reason);
            Some(if color.enabled() {
                msg.yellow().to_string()
            } else {
                msg
            })
        }
        ProgressEvent::ParagraphDone { .. } | ProgressEvent::Checkpoint { .. } => None,
        ProgressEvent::RateLimitWait {
            file,
            index,
            attempt,
            wait,
            reason,
        } => {
            let msg = format!(
                "  {} paragraph {}: {} (retry {} in {:.1}s)",
                file,
                index + 1,
                reason,
                attempt,
                wait.as_secs_f64()
            );
            Some(if color.enabled() {
                msg.yellow().to_string()
            } else {
                msg
            })
        }
        ProgressEvent::FileFinished {
            file,
            entries_added,
        } => {
            let msg = format!("Finished {} (+{} entries)", file, entries_added);
            Some(if color.enabled() {
                msg.green().to_string()
            } else {
                msg
            })
        }
        ProgressEvent::FileFailed { file, error } => {
            let msg = format!("Failed {}: {}", file, error);
            Some(if color.enabled() {
                msg.red().to_string()
            } else {
                msg
            })
        }
    }
}

/// Print the totals of a generation run.
pub fn print_run_summary(
    w: &mut dyn Write,
    summary: &RunSummary,
    dataset_len: usize,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", "SUMMARY".bold())?;
    } else {
        writeln!(w, "SUMMARY")?;
    }
    writeln!(
        w,
        "  Reports:    {} completed, {} skipped, {} total",
        summary.files_completed, summary.files_skipped, summary.files_total
    )?;
    writeln!(w, "  Paragraphs: {}", summary.paragraphs_processed)?;
    if color.enabled() {
        writeln!(
            w,
            "  Entries:    {} added",
            summary.entries_added.green()
        )?;
    } else {
        writeln!(w, "  Entries:    {} added", summary.entries_added)?;
    }
    writeln!(w, "  Rejected:   {}", summary.rejected)?;
    if summary.malformed > 0 {
        if color.enabled() {
            writeln!(w, "  Malformed:  {}", summary.malformed.yellow())?;
        } else {
            writeln!(w, "  Malformed:  {}", summary.malformed)?;
        }
    }
    writeln!(w, "  Dataset:    {} entries total", dataset_len)?;

    if summary.cancelled {
        writeln!(w)?;
        let msg = "Interrupted. Progress was checkpointed; run `reportsft generate` again to resume.";
        if color.enabled() {
            writeln!(w, "{}", msg.yellow())?;
        } else {
            writeln!(w, "{}", msg)?;
        }
    }
    Ok(())
}

/// Print per-report progress as a table.
pub fn print_status(
    w: &mut dyn Write,
    rows: &[ReportStatus],
    color: ColorMode,
) -> std::io::Result<()> {
    if rows.is_empty() {
        writeln!(w, "No reports found and nothing tracked yet.")?;
        return Ok(());
    }

    let width = rows.iter().map(|r| r.file.len()).max().unwrap_or(0).max(6);
    writeln!(
        w,
        "{:<width$}  {:<11}  {:>9}  {:>7}",
        "REPORT",
        "STATUS",
        "PARAGRAPH",
        "ENTRIES",
        width = width
    )?;

    let mut completed = 0;
    let mut entries = 0;
    for row in rows {
        entries += row.entries;
        let label = if row.status.completed {
            completed += 1;
            "completed"
        } else if row.status.paragraph_index > 0 {
            "in progress"
        } else {
            "pending"
        };
        let padded = format!("{:<11}", label);
        let status = if !color.enabled() {
            padded
        } else if row.status.completed {
            padded.green().to_string()
        } else if row.status.paragraph_index > 0 {
            padded.yellow().to_string()
        } else {
            padded.dimmed().to_string()
        };
        let missing = if row.on_disk { "" } else { "  (missing)" };
        writeln!(
            w,
            "{:<width$}  {}  {:>9}  {:>7}{}",
            row.file,
            status,
            row.status.paragraph_index,
            row.entries,
            missing,
            width = width
        )?;
    }

    writeln!(w)?;
    writeln!(
        w,
        "{}/{} reports completed, {} dataset entries",
        completed,
        rows.len(),
        entries
    )?;
    Ok(())
}

pub fn print_reset(
    w: &mut dyn Write,
    file: &str,
    outcome: &ResetOutcome,
    color: ColorMode,
) -> std::io::Result<()> {
    if !outcome.tracker_entry && outcome.dataset_entries == 0 {
        writeln!(w, "Nothing recorded for {}", file)?;
        return Ok(());
    }
    let msg = format!(
        "Reset {}: removed {} dataset entries{}",
        file,
        outcome.dataset_entries,
        if outcome.tracker_entry {
            " and its tracker entry"
        } else {
            ""
        }
    );
    if color.enabled() {
        writeln!(w, "{}", msg.green())?;
    } else {
        writeln!(w, "{}", msg)?;
    }
    Ok(())
}

pub fn print_models(w: &mut dyn Write, models: &[ModelSummary]) -> std::io::Result<()> {
    if models.is_empty() {
        writeln!(w, "No models support generateContent for this key.")?;
        return Ok(());
    }
    for model in models {
        let name = model.name.strip_prefix("models/").unwrap_or(&model.name);
        match (&model.display_name, model.input_token_limit) {
            (Some(display), Some(limit)) => {
                writeln!(w, "{:<40} {} ({} input tokens)", name, display, limit)?
            }
            (Some(display), None) => writeln!(w, "{:<40} {}", name, display)?,
            _ => writeln!(w, "{}", name)?,
        }
    }
    Ok(())
}

pub fn print_prepare_report(
    w: &mut dyn Write,
    report: &PrepareReport,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w, "Loaded {} entries", report.loaded)?;
    let saved = format!(
        "Saved {} training examples to {}",
        report.train,
        report.train_path.display()
    );
    if color.enabled() {
        writeln!(w, "{}", saved.green())?;
    } else {
        writeln!(w, "{}", saved)?;
    }
    if let Some(val_path) = &report.val_path {
        writeln!(
            w,
            "Saved {} validation examples to {}",
            report.val,
            val_path.display()
        )?;
    }
    if let Some(sample) = &report.sample {
        writeln!(w)?;
        writeln!(w, "Sample:")?;
        writeln!(w, "  instruction: {}", sample.instruction)?;
        writeln!(w, "  input:       {}", sample.input)?;
        writeln!(w, "  output:      {}", sample.output)?;
    }
    Ok(())
}

/// Header printed before each model's answer in `compare`.
pub fn compare_header(label: &str, model: &str, color: ColorMode) -> String {
    let header = format!("--- Querying {} ({}) ---", model, label);
    if color.enabled() {
        header.cyan().bold().to_string()
    } else {
        header
    }
}

pub fn compare_separator() -> String {
    "=".repeat(50)
}

pub fn print_export_step(
    w: &mut dyn Write,
    step: &ExportStep,
    color: ColorMode,
) -> std::io::Result<()> {
    match step {
        ExportStep::TokenizerFixed(fix) => {
            if fix.removed_sentencepiece {
                writeln!(w, "Removed tokenizer.model (using tokenizer.json)")?;
            }
            match (&fix.previous_class, fix.class_updated) {
                (Some(prev), true) => writeln!(w, "Updated tokenizer_class (was {})", prev)?,
                (None, true) => writeln!(w, "Set tokenizer_class")?,
                _ => {}
            }
        }
        ExportStep::Running { command } => {
            if color.enabled() {
                writeln!(w, "{} {}", "Running".bold(), command.dimmed())?;
            } else {
                writeln!(w, "Running {}", command)?;
            }
        }
        ExportStep::Finished { output } => {
            let msg = format!("Exported {}", output.display());
            if color.enabled() {
                writeln!(w, "{}", msg.green())?;
            } else {
                writeln!(w, "{}", msg)?;
            }
        }
    }
    Ok(())
}
