//! GGUF export of a merged fine-tuned model through llama.cpp.
//!
//! The merged Hugging Face directory is produced by the training stack. This
//! module only prepares its tokenizer files and drives llama.cpp's converter
//! and quantizer as subprocesses.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::Value;
use thiserror::Error;

use crate::persist::{StateError, read_json, write_json_atomic};

pub const DEFAULT_MERGED_DIR: &str = "merged_model";
pub const DEFAULT_LLAMA_CPP_DIR: &str = "llama.cpp";
pub const DEFAULT_F16_OUTPUT: &str = "qwen2.5_7b_finetuned.gguf";
pub const DEFAULT_QUANTIZED_OUTPUT: &str = "qwen2.5_7b_finetuned-Q4_K_M.gguf";
pub const DEFAULT_QUANT_METHOD: &str = "Q4_K_M";
pub const DEFAULT_TOKENIZER_CLASS: &str = "Qwen2Tokenizer";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("merged model directory not found: {}", .0.display())]
    MergedDirMissing(PathBuf),
    #[error("tokenizer.json not found in {}", .0.display())]
    MissingTokenizerJson(PathBuf),
    #[error("could not find {}. Is llama.cpp cloned?", .0.display())]
    ConvertScriptMissing(PathBuf),
    #[error("could not find llama-quantize binary at {}", .0.display())]
    QuantizeBinaryMissing(PathBuf),
    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: String },
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub merged_dir: PathBuf,
    pub llama_cpp_dir: PathBuf,
    pub f16_output: PathBuf,
    pub quantized_output: PathBuf,
    pub quant_method: String,
    pub tokenizer_class: String,
    /// Interpreter for `convert_hf_to_gguf.py`.
    pub python: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            merged_dir: PathBuf::from(DEFAULT_MERGED_DIR),
            llama_cpp_dir: PathBuf::from(DEFAULT_LLAMA_CPP_DIR),
            f16_output: PathBuf::from(DEFAULT_F16_OUTPUT),
            quantized_output: PathBuf::from(DEFAULT_QUANTIZED_OUTPUT),
            quant_method: DEFAULT_QUANT_METHOD.to_string(),
            tokenizer_class: DEFAULT_TOKENIZER_CLASS.to_string(),
            python: "python3".to_string(),
        }
    }
}

/// Steps reported while exporting.
#[derive(Debug, Clone)]
pub enum ExportStep {
    TokenizerFixed(TokenizerFix),
    Running { command: String },
    Finished { output: PathBuf },
}

/// What [`fix_tokenizer_files`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizerFix {
    /// `tokenizer.model` was deleted so llama.cpp treats the tokenizer as BPE.
    pub removed_sentencepiece: bool,
    /// `tokenizer_class` found in `tokenizer_config.json`, if the file exists.
    pub previous_class: Option<String>,
    pub class_updated: bool,
}

/// Prepare the tokenizer files of a merged model for llama.cpp conversion.
pub fn fix_tokenizer_files(
    merged_dir: &Path,
    tokenizer_class: &str,
) -> Result<TokenizerFix, ExportError> {
    if !merged_dir.is_dir() {
        return Err(ExportError::MergedDirMissing(merged_dir.to_path_buf()));
    }
    let mut fix = TokenizerFix::default();

    let sentencepiece = merged_dir.join("tokenizer.model");
    if sentencepiece.exists() {
        std::fs::remove_file(&sentencepiece).map_err(|source| ExportError::Remove {
            path: sentencepiece.clone(),
            source,
        })?;
        tracing::info!(path = %sentencepiece.display(), "removed tokenizer.model");
        fix.removed_sentencepiece = true;
    }

    if !merged_dir.join("tokenizer.json").is_file() {
        return Err(ExportError::MissingTokenizerJson(merged_dir.to_path_buf()));
    }

    let config_path = merged_dir.join("tokenizer_config.json");
    if let Some(mut config) = read_json::<Value>(&config_path)? {
        fix.previous_class = config
            .get("tokenizer_class")
            .and_then(Value::as_str)
            .map(str::to_string);
        if fix.previous_class.as_deref() != Some(tokenizer_class)
            && let Some(obj) = config.as_object_mut()
        {
            obj.insert(
                "tokenizer_class".to_string(),
                Value::String(tokenizer_class.to_string()),
            );
            write_json_atomic(&config_path, &config)?;
            tracing::info!(
                from = ?fix.previous_class,
                to = tokenizer_class,
                "updated tokenizer_class"
            );
            fix.class_updated = true;
        }
    }

    Ok(fix)
}

/// `llama-quantize` under `build/bin/` (CMake builds), else at the llama.cpp root.
pub fn find_quantize_binary(llama_cpp_dir: &Path) -> Result<PathBuf, ExportError> {
    let cmake = llama_cpp_dir.join("build").join("bin").join("llama-quantize");
    if cmake.is_file() {
        return Ok(cmake);
    }
    let root = llama_cpp_dir.join("llama-quantize");
    if root.is_file() {
        return Ok(root);
    }
    Err(ExportError::QuantizeBinaryMissing(root))
}

fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a subprocess to completion with inherited stdio.
async fn run_command(program: &str, args: &[String]) -> Result<(), ExportError> {
    let command = command_line(program, args);
    tracing::info!(command = %command, "running");
    let status = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|source| ExportError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !status.success() {
        return Err(ExportError::CommandFailed {
            command,
            status: status.to_string(),
        });
    }
    Ok(())
}

/// Fix tokenizer files, convert to an f16 GGUF, then quantize it.
pub async fn export_gguf(
    options: &ExportOptions,
    on_step: &(dyn Fn(ExportStep) + Send + Sync),
) -> Result<PathBuf, ExportError> {
    let fix = fix_tokenizer_files(&options.merged_dir, &options.tokenizer_class)?;
    on_step(ExportStep::TokenizerFixed(fix));

    let script = options.llama_cpp_dir.join("convert_hf_to_gguf.py");
    if !script.is_file() {
        return Err(ExportError::ConvertScriptMissing(script));
    }
    let convert_args = vec![
        script.display().to_string(),
        options.merged_dir.display().to_string(),
        "--outfile".to_string(),
        options.f16_output.display().to_string(),
        "--outtype".to_string(),
        "f16".to_string(),
    ];
    on_step(ExportStep::Running {
        command: command_line(&options.python, &convert_args),
    });
    run_command(&options.python, &convert_args).await?;

    let quantize = find_quantize_binary(&options.llama_cpp_dir)?;
    let quantize = quantize.display().to_string();
    let quantize_args = vec![
        options.f16_output.display().to_string(),
        options.quantized_output.display().to_string(),
        options.quant_method.clone(),
    ];
    on_step(ExportStep::Running {
        command: command_line(&quantize, &quantize_args),
    });
    run_command(&quantize, &quantize_args).await?;

    on_step(ExportStep::Finished {
        output: options.quantized_output.clone(),
    });
    Ok(options.quantized_output.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged_dir(with_json: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokenizer.model"), b"spm").unwrap();
        if with_json {
            std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();
        }
        dir
    }

    #[test]
    fn fixes_tokenizer_files() {
        let dir = merged_dir(true);
        std::fs::write(
            dir.path().join("tokenizer_config.json"),
            r#"{"tokenizer_class": "LlamaTokenizer", "model_max_length": 32768}"#,
        )
        .unwrap();

        let fix = fix_tokenizer_files(dir.path(), DEFAULT_TOKENIZER_CLASS).unwrap();
        assert!(fix.removed_sentencepiece);
        assert!(fix.class_updated);
        assert_eq!(fix.previous_class.as_deref(), Some("LlamaTokenizer"));
        assert!(!dir.path().join("tokenizer.model").exists());

        let config: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("tokenizer_config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(config["tokenizer_class"], "Qwen2Tokenizer");
        assert_eq!(config["model_max_length"], 32768);
    }

    #[test]
    fn matching_class_left_alone() {
        let dir = merged_dir(true);
        std::fs::write(
            dir.path().join("tokenizer_config.json"),
            r#"{"tokenizer_class": "Qwen2Tokenizer"}"#,
        )
        .unwrap();
        let fix = fix_tokenizer_files(dir.path(), DEFAULT_TOKENIZER_CLASS).unwrap();
        assert!(!fix.class_updated);
    }

    #[test]
    fn missing_tokenizer_json_is_error() {
        let dir = merged_dir(false);
        let err = fix_tokenizer_files(dir.path(), DEFAULT_TOKENIZER_CLASS).unwrap_err();
        assert!(matches!(err, ExportError::MissingTokenizerJson(_)));
    }

    #[test]
    fn missing_merged_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            fix_tokenizer_files(&dir.path().join("merged_model"), DEFAULT_TOKENIZER_CLASS)
                .unwrap_err();
        assert!(matches!(err, ExportError::MergedDirMissing(_)));
    }

    #[test]
    fn quantize_binary_lookup_prefers_build_bin() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_quantize_binary(dir.path()),
            Err(ExportError::QuantizeBinaryMissing(_))
        ));

        std::fs::write(dir.path().join("llama-quantize"), b"").unwrap();
        assert_eq!(
            find_quantize_binary(dir.path()).unwrap(),
            dir.path().join("llama-quantize")
        );

        let bin = dir.path().join("build").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("llama-quantize"), b"").unwrap();
        assert_eq!(
            find_quantize_binary(dir.path()).unwrap(),
            bin.join("llama-quantize")
        );
    }

    #[tokio::test]
    async fn missing_convert_script_is_error() {
        let merged = merged_dir(true);
        let llama = tempfile::tempdir().unwrap();
        let options = ExportOptions {
            merged_dir: merged.path().to_path_buf(),
            llama_cpp_dir: llama.path().to_path_buf(),
            ..Default::default()
        };
        let err = export_gguf(&options, &|_| {}).await.unwrap_err();
        assert!(matches!(err, ExportError::ConvertScriptMissing(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_convert_then_quantize() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Mutex;

        let merged = merged_dir(true);
        let llama = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        // Stand-in converter: `sh convert_hf_to_gguf.py <merged> --outfile <f16> --outtype f16`
        std::fs::write(
            llama.path().join("convert_hf_to_gguf.py"),
            "touch \"$3\"\n",
        )
        .unwrap();
        let bin = llama.path().join("build").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let quantize = bin.join("llama-quantize");
        std::fs::write(&quantize, "#!/bin/sh\ntest -f \"$1\" && touch \"$2\"\n").unwrap();
        std::fs::set_permissions(&quantize, std::fs::Permissions::from_mode(0o755)).unwrap();

        let options = ExportOptions {
            merged_dir: merged.path().to_path_buf(),
            llama_cpp_dir: llama.path().to_path_buf(),
            f16_output: out.path().join("model-f16.gguf"),
            quantized_output: out.path().join("model-Q4_K_M.gguf"),
            python: "sh".to_string(),
            ..Default::default()
        };

        let commands = Mutex::new(Vec::new());
        let output = export_gguf(&options, &|step| {
            if let ExportStep::Running { command } = step {
                commands.lock().unwrap().push(command);
            }
        })
        .await
        .unwrap();

        assert_eq!(output, out.path().join("model-Q4_K_M.gguf"));
        assert!(output.exists());
        let commands = commands.into_inner().unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("--outtype f16"));
        assert!(commands[1].ends_with("Q4_K_M"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_command_line() {
        let err = run_command("false", &["--flag".to_string()]).await.unwrap_err();
        match err {
            ExportError::CommandFailed { command, .. } => assert_eq!(command, "false --flag"),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
