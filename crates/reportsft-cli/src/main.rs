use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use reportsft_core::config_file::{self, ConfigFile};
use reportsft_core::llm::{GeminiGenerator, list_models};
use reportsft_core::ollama::OllamaClient;
use reportsft_core::{
    AdaptiveLimiter, DatasetStore, GenerationSettings, PdfBackend, ProgressEvent, alpaca, export,
};
use reportsft_pdf_mupdf::MupdfBackend;

mod output;
mod progress;
mod settings;

use output::ColorMode;
use progress::GenerationProgress;

/// Build a fine-tuning dataset of Q&A pairs from PDF reports
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Read configuration from this TOML file instead of the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate Q&A pairs from every PDF in the reports directory
    Generate(GenerateArgs),

    /// Convert the dataset to Alpaca-format fine-tuning records
    Prepare(PrepareArgs),

    /// List Gemini models that support content generation
    ListModels(GeminiArgs),

    /// Show per-report progress from the tracker and dataset
    Status {
        #[command(flatten)]
        paths: PathArgs,

        /// Forget all progress for this report (tracker entry and dataset entries)
        #[arg(long, value_name = "FILE")]
        reset: Option<String>,
    },

    /// Ask the base and fine-tuned models the same questions via Ollama
    Compare(CompareArgs),

    /// Convert a merged Hugging Face model to a quantized GGUF with llama.cpp
    ExportGguf(ExportArgs),
}

#[derive(Args, Debug, Default)]
struct PathArgs {
    /// Directory containing the PDF reports [env: REPORTS_DIR]
    #[arg(long)]
    reports_dir: Option<PathBuf>,

    /// Progress tracker file
    #[arg(long)]
    tracker: Option<PathBuf>,

    /// Dataset file
    #[arg(long)]
    dataset: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct GeminiArgs {
    /// Gemini API key [env: GEMINI_API_KEY]
    #[arg(long)]
    api_key: Option<String>,

    /// Gemini API base URL
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Args, Debug, Default)]
struct GenerateArgs {
    #[command(flatten)]
    paths: PathArgs,

    #[command(flatten)]
    gemini: GeminiArgs,

    /// Gemini model name [env: GEMINI_MODEL]
    #[arg(long)]
    model: Option<String>,

    /// Subject matter named in the prompt, e.g. "central bank annual reports"
    #[arg(long)]
    domain: Option<String>,

    /// Number of preceding paragraphs sent as context
    #[arg(long)]
    context: Option<usize>,

    /// Drop paragraphs with this many words or fewer
    #[arg(long)]
    min_words: Option<usize>,

    /// Paragraphs processed between checkpoints
    #[arg(long)]
    checkpoint_interval: Option<usize>,

    /// Request rate limit
    #[arg(long = "rpm")]
    requests_per_minute: Option<u32>,

    /// Retries per paragraph for rate limits and transient errors
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args, Debug, Default)]
struct PrepareArgs {
    /// Dataset produced by `generate`
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Output file for the Alpaca records
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Hold out this fraction of records as a validation file
    #[arg(long)]
    val_ratio: Option<f64>,

    /// Shuffle seed for the validation split
    #[arg(long)]
    seed: Option<u64>,

    /// Instruction text for every record
    #[arg(long)]
    instruction: Option<String>,
}

#[derive(Args, Debug, Default)]
struct CompareArgs {
    /// Ollama server URL [env: OLLAMA_URL]
    #[arg(long)]
    ollama_url: Option<String>,

    /// Model to compare against
    #[arg(long)]
    base_model: Option<String>,

    /// Fine-tuned model
    #[arg(long)]
    finetuned_model: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,
}

#[derive(Args, Debug, Default)]
struct ExportArgs {
    /// Merged Hugging Face model directory
    #[arg(long)]
    merged_dir: Option<PathBuf>,

    /// llama.cpp checkout (with a built llama-quantize)
    #[arg(long)]
    llama_cpp: Option<PathBuf>,

    /// Intermediate f16 GGUF
    #[arg(long)]
    f16_output: Option<PathBuf>,

    /// Quantized GGUF
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// llama-quantize method
    #[arg(long)]
    method: Option<String>,

    /// tokenizer_class written to tokenizer_config.json
    #[arg(long)]
    tokenizer_class: Option<String>,

    /// Python interpreter used for the conversion script
    #[arg(long)]
    python: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = init_tracing(cli.global.verbose, cli.global.log_file.as_deref())?;

    let file_config = match &cli.global.config {
        Some(path) => match config_file::load_from_path(path) {
            Some(config) => config,
            None => anyhow::bail!("Could not load config file {}", path.display()),
        },
        None => config_file::load_config(),
    };
    let color = ColorMode(!cli.global.no_color);

    match cli.command {
        Command::Generate(args) => generate(args, &file_config, color).await,
        Command::Prepare(args) => prepare(args, &file_config, color),
        Command::ListModels(args) => list(args, &file_config).await,
        Command::Status { paths, reset } => status(paths, reset, &file_config, color),
        Command::Compare(args) => compare(args, &file_config, color).await,
        Command::ExportGguf(args) => export_gguf(args, &file_config, color).await,
    }
}

/// Stderr logging filtered by `RUST_LOG` or `-v`, plus an optional file sink.
fn init_tracing(
    verbose: u8,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let stderr_filter = if verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Cannot open log file {}: {}", path.display(), e))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new("info,reportsft_core=debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn generate(args: GenerateArgs, file_config: &ConfigFile, color: ColorMode) -> anyhow::Result<()> {
    let config = settings::resolve_generate(&args, file_config, &settings::process_env)?;
    tracing::debug!(?config, "resolved generation settings");

    if !config.settings.reports_dir.is_dir() {
        anyhow::bail!(
            "Reports directory not found: {}. Create it and add PDFs, or pass --reports-dir.",
            config.settings.reports_dir.display()
        );
    }

    let generator = GeminiGenerator::new(
        reqwest::Client::new(),
        config.gemini.api_key.clone(),
        &config.model,
    )
    .with_base_url(config.gemini.base_url.clone())
    .with_domain(config.domain.clone())
    .with_timeout(config.request_timeout);
    let limiter = AdaptiveLimiter::per_minute(config.requests_per_minute);
    let backend: Arc<dyn PdfBackend> = Arc::new(MupdfBackend::new());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let bars = GenerationProgress::new(color);
    let progress = |event: ProgressEvent| bars.handle(&event);
    let result = reportsft_core::run_generation(
        &config.settings,
        backend,
        &generator,
        &limiter,
        &progress,
        &cancel,
    )
    .await;
    bars.finish();
    let summary = result?;

    let dataset_len = DatasetStore::load(&config.settings.dataset_path)?.len();
    let mut stdout = std::io::stdout();
    output::print_run_summary(&mut stdout, &summary, dataset_len, color)?;
    Ok(())
}

fn prepare(args: PrepareArgs, file_config: &ConfigFile, color: ColorMode) -> anyhow::Result<()> {
    let config = settings::resolve_prepare(&args, file_config)?;
    let report = alpaca::prepare(&config.input, &config.output, &config.options)?;
    output::print_prepare_report(&mut std::io::stdout(), &report, color)?;
    Ok(())
}

async fn list(args: GeminiArgs, file_config: &ConfigFile) -> anyhow::Result<()> {
    let access = settings::resolve_gemini(&args, file_config, &settings::process_env)?;
    let models = list_models(&reqwest::Client::new(), &access.base_url, &access.api_key).await?;
    output::print_models(&mut std::io::stdout(), &models)?;
    Ok(())
}

fn status(
    paths: PathArgs,
    reset: Option<String>,
    file_config: &ConfigFile,
    color: ColorMode,
) -> anyhow::Result<()> {
    let paths = settings::resolve_paths(&paths, file_config, &settings::process_env);
    let settings = GenerationSettings {
        reports_dir: paths.reports_dir,
        tracker_path: paths.tracker,
        dataset_path: paths.dataset,
        ..Default::default()
    };
    let mut stdout = std::io::stdout();

    if let Some(file) = reset {
        let outcome = reportsft_core::reset_report(&settings, &file)?;
        output::print_reset(&mut stdout, &file, &outcome, color)?;
        return Ok(());
    }

    let rows = reportsft_core::report_status(&settings)?;
    output::print_status(&mut stdout, &rows, color)?;
    Ok(())
}

async fn compare(args: CompareArgs, file_config: &ConfigFile, color: ColorMode) -> anyhow::Result<()> {
    let config = settings::resolve_compare(&args, file_config, &settings::process_env);
    let client = OllamaClient::new(reqwest::Client::new(), &config.ollama_url);

    let mut stdout = std::io::stdout();
    let title = format!(
        "=== Model Comparison: {} vs {} ===",
        config.finetuned_model, config.base_model
    );
    if color.enabled() {
        writeln!(stdout, "{}", title.bold())?;
    } else {
        writeln!(stdout, "{}", title)?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        write!(stdout, "\nEnter your prompt (or 'q' to quit): ")?;
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            writeln!(stdout)?;
            break;
        };
        let prompt = line.trim();
        if prompt.eq_ignore_ascii_case("q") {
            break;
        }
        if prompt.is_empty() {
            continue;
        }

        for (label, model) in [
            ("Base", &config.base_model),
            ("Fine-tuned", &config.finetuned_model),
        ] {
            writeln!(stdout, "\n{}", output::compare_header(label, model, color))?;
            match client.generate(model, prompt, config.sampling).await {
                Ok(answer) => writeln!(stdout, "{}", answer)?,
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "ollama query failed");
                    if color.enabled() {
                        writeln!(stdout, "{}", format!("Error: {}", e).red())?;
                    } else {
                        writeln!(stdout, "Error: {}", e)?;
                    }
                }
            }
        }
        writeln!(stdout, "\n{}", output::compare_separator())?;
    }
    Ok(())
}

async fn export_gguf(args: ExportArgs, file_config: &ConfigFile, color: ColorMode) -> anyhow::Result<()> {
    let options = settings::resolve_export(&args, file_config);
    let on_step = |step: export::ExportStep| {
        let mut stdout = std::io::stdout();
        let _ = output::print_export_step(&mut stdout, &step, color);
        let _ = stdout.flush();
    };
    export::export_gguf(&options, &on_step).await?;
    Ok(())
}
