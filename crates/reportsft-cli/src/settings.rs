//! Option resolution: CLI flag > environment variable > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use reportsft_core::config_file::ConfigFile;
use reportsft_core::export::{
    DEFAULT_F16_OUTPUT, DEFAULT_LLAMA_CPP_DIR, DEFAULT_MERGED_DIR, DEFAULT_QUANT_METHOD,
    DEFAULT_QUANTIZED_OUTPUT, DEFAULT_TOKENIZER_CLASS, ExportOptions,
};
use reportsft_core::llm::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use reportsft_core::llm::prompt::DEFAULT_DOMAIN;
use reportsft_core::ollama::{DEFAULT_BASE_MODEL, DEFAULT_FINETUNED_MODEL};
use reportsft_core::rate_limit::DEFAULT_REQUESTS_PER_MINUTE;
use reportsft_core::{
    DEFAULT_DATASET_PATH, DEFAULT_REPORTS_DIR, DEFAULT_TRACKER_PATH, GenerationSettings,
    RetryPolicy, alpaca, ollama,
};

use crate::{CompareArgs, ExportArgs, GenerateArgs, GeminiArgs, PathArgs, PrepareArgs};

pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_MODEL: &str = "GEMINI_MODEL";
pub const ENV_REPORTS_DIR: &str = "REPORTS_DIR";
pub const ENV_OLLAMA_URL: &str = "OLLAMA_URL";

/// Environment lookup; injectable so resolution can be tested without
/// touching the process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read an environment variable, treating empty values as unset.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Paths of the reports directory and the two state files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub reports_dir: PathBuf,
    pub tracker: PathBuf,
    pub dataset: PathBuf,
}

pub fn resolve_paths(args: &PathArgs, file: &ConfigFile, env: EnvLookup) -> StatePaths {
    let paths = file.paths.clone().unwrap_or_default();
    StatePaths {
        reports_dir: args
            .reports_dir
            .clone()
            .or_else(|| env(ENV_REPORTS_DIR).map(PathBuf::from))
            .or_else(|| paths.reports_dir.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORTS_DIR)),
        tracker: args
            .tracker
            .clone()
            .or_else(|| paths.tracker.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TRACKER_PATH)),
        dataset: args
            .dataset
            .clone()
            .or_else(|| paths.dataset.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_PATH)),
    }
}

/// Credentials and endpoint for the Gemini API.
#[derive(Clone, PartialEq, Eq)]
pub struct GeminiAccess {
    pub api_key: String,
    pub base_url: String,
}

impl std::fmt::Debug for GeminiAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiAccess")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

pub fn resolve_gemini(
    args: &GeminiArgs,
    file: &ConfigFile,
    env: EnvLookup,
) -> anyhow::Result<GeminiAccess> {
    let api_key = args
        .api_key
        .clone()
        .or_else(|| env(ENV_API_KEY))
        .or_else(|| file.api_keys.as_ref().and_then(|k| k.gemini_api_key.clone()));
    let Some(api_key) = api_key else {
        anyhow::bail!(
            "No Gemini API key. Set {} (in the environment or a .env file), pass --api-key, \
             or add gemini_api_key under [api_keys] in the config file.",
            ENV_API_KEY
        );
    };
    let base_url = args
        .base_url
        .clone()
        .or_else(|| file.generation.as_ref().and_then(|g| g.base_url.clone()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    Ok(GeminiAccess { api_key, base_url })
}

/// Everything `generate` needs.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub settings: GenerationSettings,
    pub gemini: GeminiAccess,
    pub model: String,
    pub domain: String,
    pub requests_per_minute: u32,
    pub request_timeout: Duration,
}

pub fn resolve_generate(
    args: &GenerateArgs,
    file: &ConfigFile,
    env: EnvLookup,
) -> anyhow::Result<GenerateConfig> {
    let gemini = resolve_gemini(&args.gemini, file, env)?;
    let paths = resolve_paths(&args.paths, file, env);
    let generation = file.generation.clone().unwrap_or_default();

    let model = args
        .model
        .clone()
        .or_else(|| env(ENV_MODEL))
        .or(generation.model)
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let checkpoint_interval = args
        .checkpoint_interval
        .or(generation.checkpoint_interval)
        .unwrap_or(reportsft_core::DEFAULT_CHECKPOINT_INTERVAL);
    if checkpoint_interval == 0 {
        anyhow::bail!("--checkpoint-interval must be at least 1");
    }
    let requests_per_minute = args
        .requests_per_minute
        .or(generation.requests_per_minute)
        .unwrap_or(DEFAULT_REQUESTS_PER_MINUTE);
    if requests_per_minute == 0 {
        anyhow::bail!("--requests-per-minute must be at least 1");
    }

    let defaults = GenerationSettings::default();
    let settings = GenerationSettings {
        reports_dir: paths.reports_dir,
        tracker_path: paths.tracker,
        dataset_path: paths.dataset,
        context_paragraphs: args
            .context
            .or(generation.context_paragraphs)
            .unwrap_or(defaults.context_paragraphs),
        min_words: args
            .min_words
            .or(generation.min_words)
            .unwrap_or(defaults.min_words),
        checkpoint_interval,
        retry: RetryPolicy {
            max_retries: args
                .max_retries
                .or(generation.max_retries)
                .unwrap_or(defaults.retry.max_retries),
            ..defaults.retry
        },
    };

    Ok(GenerateConfig {
        settings,
        gemini,
        model,
        domain: args
            .domain
            .clone()
            .or(generation.domain)
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
        requests_per_minute,
        request_timeout: Duration::from_secs(
            args.timeout_secs
                .or(generation.request_timeout_secs)
                .unwrap_or(reportsft_core::llm::gemini::DEFAULT_TIMEOUT.as_secs()),
        ),
    })
}

pub struct PrepareConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: alpaca::PrepareOptions,
}

pub fn resolve_prepare(args: &PrepareArgs, file: &ConfigFile) -> anyhow::Result<PrepareConfig> {
    let paths = file.paths.clone().unwrap_or_default();
    let split = match args.val_ratio {
        Some(ratio) if !(0.0..1.0).contains(&ratio) => {
            anyhow::bail!("--val-ratio must be in [0, 1), got {}", ratio)
        }
        Some(ratio) if ratio > 0.0 => Some(alpaca::ValidationSplit {
            ratio,
            seed: args.seed.unwrap_or(alpaca::DEFAULT_SPLIT_SEED),
        }),
        _ => None,
    };
    Ok(PrepareConfig {
        input: args
            .dataset
            .clone()
            .or_else(|| paths.dataset.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_PATH)),
        output: args
            .output
            .clone()
            .or_else(|| paths.finetune_output.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(alpaca::DEFAULT_OUTPUT_PATH)),
        options: alpaca::PrepareOptions {
            instruction: args
                .instruction
                .clone()
                .unwrap_or_else(|| alpaca::DEFAULT_INSTRUCTION.to_string()),
            split,
        },
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareConfig {
    pub ollama_url: String,
    pub base_model: String,
    pub finetuned_model: String,
    pub sampling: ollama::SamplingOptions,
}

pub fn resolve_compare(args: &CompareArgs, file: &ConfigFile, env: EnvLookup) -> CompareConfig {
    let compare = file.compare.clone().unwrap_or_default();
    let defaults = ollama::SamplingOptions::default();
    CompareConfig {
        ollama_url: args
            .ollama_url
            .clone()
            .or_else(|| env(ENV_OLLAMA_URL))
            .or(compare.ollama_url)
            .unwrap_or_else(|| ollama::DEFAULT_BASE_URL.to_string()),
        base_model: args
            .base_model
            .clone()
            .or(compare.base_model)
            .unwrap_or_else(|| DEFAULT_BASE_MODEL.to_string()),
        finetuned_model: args
            .finetuned_model
            .clone()
            .or(compare.finetuned_model)
            .unwrap_or_else(|| DEFAULT_FINETUNED_MODEL.to_string()),
        sampling: ollama::SamplingOptions {
            temperature: args.temperature.unwrap_or(defaults.temperature),
            top_p: args.top_p.unwrap_or(defaults.top_p),
        },
    }
}

pub fn resolve_export(args: &ExportArgs, file: &ConfigFile) -> ExportOptions {
    let export = file.export.clone().unwrap_or_default();
    let path = |flag: &Option<PathBuf>, from_file: Option<String>, default: &str| {
        flag.clone()
            .or_else(|| from_file.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };
    ExportOptions {
        merged_dir: path(&args.merged_dir, export.merged_dir, DEFAULT_MERGED_DIR),
        llama_cpp_dir: path(&args.llama_cpp, export.llama_cpp_dir, DEFAULT_LLAMA_CPP_DIR),
        f16_output: path(&args.f16_output, export.f16_output, DEFAULT_F16_OUTPUT),
        quantized_output: path(&args.output, export.quantized_output, DEFAULT_QUANTIZED_OUTPUT),
        quant_method: args
            .method
            .clone()
            .or(export.quant_method)
            .unwrap_or_else(|| DEFAULT_QUANT_METHOD.to_string()),
        tokenizer_class: args
            .tokenizer_class
            .clone()
            .or(export.tokenizer_class)
            .unwrap_or_else(|| DEFAULT_TOKENIZER_CLASS.to_string()),
        python: args.python.clone().unwrap_or_else(|| "python3".to_string()),
    }
}
