//! Conversion of the generated dataset into Alpaca-format fine-tuning records.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::DatasetEntry;
use crate::persist::{StateError, read_json, write_json_atomic};

pub const DEFAULT_INSTRUCTION: &str =
    "Answer the question based on the provided context from the financial report.";
pub const DEFAULT_OUTPUT_PATH: &str = "finetune_dataset.json";
pub const DEFAULT_SPLIT_SEED: u64 = 42;

const PROMPT_TEMPLATE_HEADER: &str = "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlpacaRecord {
    pub instruction: String,
    pub input: String,
    pub output: String,
}

impl AlpacaRecord {
    pub fn from_entry(entry: &DatasetEntry, instruction: &str) -> Self {
        Self {
            instruction: instruction.to_string(),
            input: format!("Question: {}", entry.question),
            output: entry.answer.clone(),
        }
    }

    /// Render the record with the Alpaca training template, followed by `eos`.
    pub fn format_prompt(&self, eos: &str) -> String {
        format!(
            "{}\n\n### Instruction:\n{}\n\n### Input:\n{}\n\n### Response:\n{}{}",
            PROMPT_TEMPLATE_HEADER, self.instruction, self.input, self.output, eos
        )
    }
}

/// Hold out part of the records as a validation set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSplit {
    /// Fraction of records held out, in `0.0..1.0`.
    pub ratio: f64,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub instruction: String,
    pub split: Option<ValidationSplit>,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            instruction: DEFAULT_INSTRUCTION.to_string(),
            split: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrepareReport {
    pub loaded: usize,
    pub train: usize,
    pub train_path: PathBuf,
    pub val: usize,
    pub val_path: Option<PathBuf>,
    pub sample: Option<AlpacaRecord>,
}

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("dataset not found: {}", .0.display())]
    MissingInput(PathBuf),
    #[error("validation ratio must be in [0, 1), got {0}")]
    InvalidRatio(f64),
    #[error(transparent)]
    State(#[from] StateError),
}

/// `finetune_dataset.json` -> `finetune_dataset.val.json`.
pub fn validation_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "finetune_dataset".to_string());
    output.with_file_name(format!("{}.val.json", stem))
}

/// Split `records` into (train, val). The shuffle is deterministic for a seed.
pub fn split_records(
    mut records: Vec<AlpacaRecord>,
    split: ValidationSplit,
) -> (Vec<AlpacaRecord>, Vec<AlpacaRecord>) {
    if records.len() < 2 || split.ratio <= 0.0 {
        return (records, Vec::new());
    }
    let mut rng = fastrand::Rng::with_seed(split.seed);
    rng.shuffle(&mut records);

    let val_len = ((records.len() as f64) * split.ratio).round() as usize;
    let val_len = val_len.clamp(1, records.len() - 1);
    let val = records.split_off(records.len() - val_len);
    (records, val)
}

/// Convert the dataset at `input` and write it to `output`.
pub fn prepare(
    input: &Path,
    output: &Path,
    options: &PrepareOptions,
) -> Result<PrepareReport, PrepareError> {
    if let Some(split) = options.split
        && !(0.0..1.0).contains(&split.ratio)
    {
        return Err(PrepareError::InvalidRatio(split.ratio));
    }

    let entries: Vec<DatasetEntry> =
        read_json(input)?.ok_or_else(|| PrepareError::MissingInput(input.to_path_buf()))?;
    let loaded = entries.len();
    let records: Vec<AlpacaRecord> = entries
        .iter()
        .map(|e| AlpacaRecord::from_entry(e, &options.instruction))
        .collect();

    let (train, val) = match options.split {
        Some(split) => split_records(records, split),
        None => (records, Vec::new()),
    };

    write_json_atomic(output, &train)?;
    let val_path = if val.is_empty() {
        None
    } else {
        let path = validation_path(output);
        write_json_atomic(&path, &val)?;
        Some(path)
    };

    tracing::info!(
        loaded,
        train = train.len(),
        val = val.len(),
        output = %output.display(),
        "wrote fine-tuning dataset"
    );

    Ok(PrepareReport {
        loaded,
        train: train.len(),
        train_path: output.to_path_buf(),
        val: val.len(),
        val_path,
        sample: train.first().cloned(),
    })
}
