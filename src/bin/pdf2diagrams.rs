//! CLI binary for edgequake-diagrams.
//!
//! A thin shim over the library crate: maps CLI flags to
//! `ExtractionConfig`, runs one session over the given files and prints the
//! session summary.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_diagrams::{
    load_input, ExtractionConfig, FileStatus, OrchestrationResults, Orchestrator,
    ProcessingSession, ProgressCallback, RetryPolicy, SessionOptions, SessionProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over the session's files plus a log
/// line per finished file. Files inside a batch finish out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    /// Spinner until the session reports its file count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Admitting files…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, file_index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&file_index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl SessionProgressCallback for CliProgressCallback {
    fn on_session_start(&self, session: &ProcessingSession) {
        let total = session.files.len();
        self.activate_bar(total);
        self.bar.set_position(session.progress.completed_steps as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting extraction of {total} files…"))
        ));
    }

    fn on_file_start(&self, session: &ProcessingSession, file_index: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(file_index, Instant::now());
        if let Some(file) = session.files.get(file_index) {
            self.bar.set_message(file.name.clone());
        }
    }

    fn on_file_complete(&self, session: &ProcessingSession, file_index: usize) {
        let secs = self.elapsed_secs(file_index);
        let Some(file) = session.files.get(file_index) else {
            return;
        };
        let (questions, diagrams) = file
            .result
            .as_ref()
            .map(|r| (r.questions.len(), r.diagram_count()))
            .unwrap_or((0, 0));

        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            green("✓"),
            file.name,
            dim(&format!("{questions:>3} questions {diagrams:>3} diagrams")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.set_position(session.progress.completed_steps as u64);
    }

    fn on_file_error(&self, session: &ProcessingSession, file_index: usize, error: &str) {
        let secs = self.elapsed_secs(file_index);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        let name = session
            .files
            .get(file_index)
            .map(|f| f.name.as_str())
            .unwrap_or("?");

        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            red("✗"),
            name,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.set_position(session.progress.completed_steps as u64);
    }

    fn on_session_complete(&self, session: &ProcessingSession) {
        self.bar.finish_and_clear();

        let total = session.files.len();
        let done = session.count(FileStatus::Completed);
        let failed = session.count(FileStatus::Failed);
        if done == total {
            eprintln!(
                "{} {} files extracted successfully",
                green("✔"),
                bold(&done.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} files extracted  ({} failed, {} cancelled)",
                if done == 0 { red("✘") } else { cyan("⚠") },
                bold(&done.to_string()),
                total,
                red(&failed.to_string()),
                session.count(FileStatus::Cancelled),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract diagrams from two papers
  pdf2diagrams paper1.pdf paper2.pdf

  # Smaller batches, fewer parallel calls (rate-limited accounts)
  pdf2diagrams --batch-size 2 --concurrency 1 papers/*.pdf

  # Exponential backoff starting at 500 ms
  pdf2diagrams --exponential-backoff --retry-delay-ms 500 paper.pdf

  # Use a specific model
  pdf2diagrams --provider openai --model gpt-4.1-mini paper.pdf

  # Full session summary as JSON
  pdf2diagrams --json paper.pdf > diagrams.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium — skips auto-download
  PDFIUM_AUTO_CACHE_DIR   Override the default pdfium cache directory

  PDFium (~30 MB) is downloaded automatically on first run and cached.
"#;

/// Extract diagram coordinates from question-paper PDFs using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2diagrams",
    version,
    about = "Extract diagram coordinates from question-paper PDFs using Vision LLMs",
    long_about = "Rasterise each page of the given PDFs, ask a Vision Language Model where the \
questions and diagrams are, then validate and repair every returned bounding box. Supports \
OpenAI, Anthropic, Google Gemini, Azure OpenAI, and any OpenAI-compatible endpoint.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF files or HTTP/HTTPS URLs.
    #[arg(required = true)]
    files: Vec<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Files dispatched per batch.
    #[arg(long, env = "PDF2DIAGRAMS_BATCH_SIZE", default_value_t = 3)]
    batch_size: usize,

    /// Files processed concurrently inside a batch.
    #[arg(short, long, env = "PDF2DIAGRAMS_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Retries per collaborator call on a recoverable failure.
    #[arg(long, env = "PDF2DIAGRAMS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Delay between retries (base delay with --exponential-backoff).
    #[arg(long, env = "PDF2DIAGRAMS_RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Double the retry delay after every attempt, capped at 30 s.
    #[arg(long, env = "PDF2DIAGRAMS_EXPONENTIAL_BACKOFF")]
    exponential_backoff: bool,

    /// Largest accepted input in MiB.
    #[arg(long, env = "PDF2DIAGRAMS_MAX_FILE_SIZE_MB", default_value_t = 50)]
    max_file_size_mb: u64,

    /// Print the session summary as JSON.
    #[arg(long, env = "PDF2DIAGRAMS_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2DIAGRAMS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2DIAGRAMS_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2DIAGRAMS_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Ensure PDFium engine is available ───────────────────────────────────
    if !pdfium_auto::is_pdfium_cached() {
        if !cli.quiet {
            let dl_bar = ProgressBar::new(0);
            dl_bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold}  \
                     [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ")
                .tick_strings(TICKS),
            );
            dl_bar.set_prefix("PDF engine");
            dl_bar.set_message("Connecting…");
            dl_bar.enable_steady_tick(Duration::from_millis(80));

            let bar = dl_bar.clone();
            tokio::task::block_in_place(|| {
                pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                    if let Some(t) = total {
                        if bar.length().unwrap_or(0) != t {
                            bar.set_length(t);
                        }
                    }
                    bar.set_position(downloaded);
                }))
            })
            .context("Failed to download PDFium engine")?;

            dl_bar.finish_with_message("ready ✓");
        } else {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
        }
    }

    // ── Build config ─────────────────────────────────────────────────────
    let config = build_config(&cli)?;

    let mut inputs = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        match load_input(path, config.download_timeout_secs).await {
            Ok(file) => inputs.push(file),
            Err(e) if cli.files.len() > 1 => {
                eprintln!("{} {}", red("✗"), e);
            }
            Err(e) => return Err(e).context("Failed to load input"),
        }
    }
    if inputs.is_empty() {
        anyhow::bail!("None of the {} inputs could be loaded", cli.files.len());
    }

    let orchestrator = Orchestrator::from_config(config).context("Failed to set up extraction")?;

    let mut options = SessionOptions::default().with_persist_results(false);
    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new_dynamic();
        options = options.with_progress_callback(cb);
    }

    // ── Run session ──────────────────────────────────────────────────────
    let session_id = orchestrator.start_processing_session(inputs, options);
    orchestrator
        .wait_for_session(&session_id)
        .await
        .context("Extraction session failed")?;

    let results = orchestrator
        .get_orchestration_results(&session_id)
        .context("Session finished without results")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&results).context("Failed to serialise results")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&results, show_progress);
    }

    if results.completed_files == 0 {
        anyhow::bail!("No file was extracted");
    }
    Ok(())
}

fn print_summary(results: &OrchestrationResults, progress_shown: bool) {
    for file in &results.results {
        println!(
            "{}  {} pages  {} questions  {} diagrams",
            bold(&file.name),
            file.result.page_count,
            file.result.questions.len(),
            file.result.diagram_count(),
        );
        for page in &file.result.diagrams {
            for meta in &page.metadata {
                for d in &meta.diagrams {
                    let c = &d.coordinates;
                    println!(
                        "  p{:<3} {:<24} ({:.0},{:.0})-({:.0},{:.0})  {}  {}",
                        page.page_number,
                        d.id,
                        c.x1,
                        c.y1,
                        c.x2,
                        c.y2,
                        d.diagram_type,
                        dim(&format!("{:.2}", d.confidence)),
                    );
                }
            }
        }
        for w in &file.result.warnings {
            println!("  {} {}", cyan("⚠"), dim(w));
        }
    }
    for e in &results.errors {
        eprintln!("{} {}", red("✗"), e);
    }

    if !progress_shown {
        eprintln!(
            "Extracted {}/{} files ({} failed, {} cancelled) in {}ms",
            results.completed_files,
            results.total_files,
            results.failed_files,
            results.cancelled_files,
            results.duration_ms
        );
    }
    eprintln!(
        "   {} questions  /  {} diagrams  —  {}ms total",
        dim(&results.total_questions.to_string()),
        dim(&results.total_diagrams.to_string()),
        results.duration_ms,
    );
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli) -> Result<ExtractionConfig> {
    let policy = if cli.exponential_backoff {
        RetryPolicy::Exponential {
            base_ms: cli.retry_delay_ms,
            max_ms: 30_000,
        }
    } else {
        RetryPolicy::Fixed {
            delay_ms: cli.retry_delay_ms,
        }
    };

    let mut builder = ExtractionConfig::builder()
        .batch_size(cli.batch_size)
        .concurrency(cli.concurrency)
        .max_retries(cli.max_retries)
        .retry_policy(policy)
        .max_file_size(cli.max_file_size_mb.saturating_mul(1024 * 1024));

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }

    builder.build().context("Invalid configuration")
}
