use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api_keys: Option<ApiKeysConfig>,
    pub paths: Option<PathsConfig>,
    pub generation: Option<GenerationConfig>,
    pub compare: Option<CompareConfig>,
    pub export: Option<ExportConfig>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    pub gemini_api_key: Option<String>,
}

impl std::fmt::Debug for ApiKeysConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeysConfig")
            .field(
                "gemini_api_key",
                &self.gemini_api_key.as_ref().map(|_| "***"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    pub reports_dir: Option<String>,
    pub tracker: Option<String>,
    pub dataset: Option<String>,
    pub finetune_output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Subject matter named in the prompt, e.g. "annual reports".
    pub domain: Option<String>,
    pub context_paragraphs: Option<usize>,
    pub min_words: Option<usize>,
    pub checkpoint_interval: Option<usize>,
    pub requests_per_minute: Option<u32>,
    pub max_retries: Option<u32>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompareConfig {
    pub ollama_url: Option<String>,
    pub base_model: Option<String>,
    pub finetuned_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    pub merged_dir: Option<String>,
    pub llama_cpp_dir: Option<String>,
    pub f16_output: Option<String>,
    pub quantized_output: Option<String>,
    pub quant_method: Option<String>,
    pub tokenizer_class: Option<String>,
}

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = ".reportsft.toml";

/// Platform config directory path: `<config_dir>/reportsft/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("reportsft").join("config.toml"))
}

/// Load config by cascading CWD `.reportsft.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(LOCAL_CONFIG_FILE));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

fn merge_section<T>(base: Option<T>, overlay: Option<T>, f: impl FnOnce(T, T) -> T) -> Option<T> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(f(b, o)),
        (b, o) => o.or(b),
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        api_keys: merge_section(base.api_keys, overlay.api_keys, |b, o| ApiKeysConfig {
            gemini_api_key: o.gemini_api_key.or(b.gemini_api_key),
        }),
        paths: merge_section(base.paths, overlay.paths, |b, o| PathsConfig {
            reports_dir: o.reports_dir.or(b.reports_dir),
            tracker: o.tracker.or(b.tracker),
            dataset: o.dataset.or(b.dataset),
            finetune_output: o.finetune_output.or(b.finetune_output),
        }),
        generation: merge_section(base.generation, overlay.generation, |b, o| {
            GenerationConfig {
                model: o.model.or(b.model),
                base_url: o.base_url.or(b.base_url),
                domain: o.domain.or(b.domain),
                context_paragraphs: o.context_paragraphs.or(b.context_paragraphs),
                min_words: o.min_words.or(b.min_words),
                checkpoint_interval: o.checkpoint_interval.or(b.checkpoint_interval),
                requests_per_minute: o.requests_per_minute.or(b.requests_per_minute),
                max_retries: o.max_retries.or(b.max_retries),
                request_timeout_secs: o.request_timeout_secs.or(b.request_timeout_secs),
            }
        }),
        compare: merge_section(base.compare, overlay.compare, |b, o| CompareConfig {
            ollama_url: o.ollama_url.or(b.ollama_url),
            base_model: o.base_model.or(b.base_model),
            finetuned_model: o.finetuned_model.or(b.finetuned_model),
        }),
        export: merge_section(base.export, overlay.export, |b, o| ExportConfig {
            merged_dir: o.merged_dir.or(b.merged_dir),
            llama_cpp_dir: o.llama_cpp_dir.or(b.llama_cpp_dir),
            f16_output: o.f16_output.or(b.f16_output),
            quantized_output: o.quantized_output.or(b.quantized_output),
            quant_method: o.quant_method.or(b.quant_method),
            tokenizer_class: o.tokenizer_class.or(b.tokenizer_class),
        }),
    }
}
