//! CLI binary for edgequake-pdf2text.
//!
//! A thin shim over the library crate that maps CLI flags to `OcrConfig`,
//! builds a provider-backed engine and prints the page mapping.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2text::prompts::{DEFAULT_EOS_MARKER, DEFAULT_PROMPT};
use edgequake_pdf2text::{
    run_file, run_to_file, CropMode, GenerationEngine, InputFailurePolicy, OcrConfig,
    PageSeparator, ProgressCallback, ProviderEngine,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

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

/// Progress bar over input preparation, then a spinner while the single
/// batched generation call runs.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Rendering");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl ProgressCallback for CliProgressCallback {
    fn on_document_rasterized(&self, total_pages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_pages as u64);
        self.bar.set_prefix("Pre-processing");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Rendered {total_pages} pages"))
        ));
    }

    fn on_page_prepared(&self, _page_index: usize, _total_pages: usize) {
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_index: usize, total_pages: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page_index + 1,
            total_pages,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_generation_start(&self, batch_len: usize) {
        self.bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed_precise}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        self.bar.set_prefix("Generating");
        self.bar.set_message(format!("{batch_len} pages in one batch"));
    }

    fn on_run_complete(&self, total_pages: usize, kept_pages: usize) {
        self.bar.finish_and_clear();
        let dropped = total_pages.saturating_sub(kept_pages);
        if dropped == 0 {
            eprintln!("{} {} pages transcribed", green("✔"), bold(&kept_pages.to_string()));
        } else {
            eprintln!(
                "{} {}/{} pages kept  ({} dropped, {} not prepared)",
                cyan("⚠"),
                bold(&kept_pages.to_string()),
                total_pages,
                red(&dropped.to_string()),
                self.errors.load(Ordering::SeqCst),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Text of every page to stdout (provider from environment)
  pdf2text document.pdf

  # JSON page map {"page_0": {"text": ...}, ...}
  pdf2text --json document.pdf > pages.json

  # Local vLLM server, 16 sequences at once, drop looping pages
  OPENAI_BASE_URL=http://localhost:8000/v1 OPENAI_API_KEY=x \
    pdf2text --model deepseek-ai/DeepSeek-OCR --max-concurrency 16 --skip-repeat scan.pdf

  # Leave out pages whose input cannot be built instead of aborting
  pdf2text --keep-going -o out.txt scan.pdf

REPETITION GUARD:
  The CLI decodes through a remote provider, which does not expose per-step
  scores. The n-gram guard flags are validated but not applied; configure
  the server's no-repeat-ngram processor (e.g. vLLM logits processors)
  instead. Pages that still hit --max-tokens are caught by --skip-repeat.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY / OPENAI_BASE_URL   OpenAI-compatible endpoint
  EDGEQUAKE_LLM_PROVIDER             Provider name (openai, ollama, …)
  EDGEQUAKE_MODEL                    Model ID
  PROMPT, CROP_MODE, MAX_CONCURRENCY, NUM_WORKERS, SKIP_REPEAT
                                     Same as the matching flags
  RUST_LOG                           Log filter (overrides -v / -q)
"#;

/// Transcribe PDF pages with a vision OCR model in one batched call.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2text",
    version,
    about = "Batched PDF-to-text OCR with an n-gram repetition guard",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write output to this file (`.json` → page map) instead of stdout.
    #[arg(short, long, env = "PDF2TEXT_OUTPUT")]
    output: Option<PathBuf>,

    /// Provider name (openai, ollama, …). Auto-detected if not set.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Model ID served by the provider.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Prompt attached to every page.
    #[arg(long, env = "PROMPT", default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Crop mode: none, tiled or auto.
    #[arg(long, env = "CROP_MODE", default_value = "auto")]
    crop_mode: CropMode,

    /// Sequences the engine may decode at once.
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 1)]
    max_concurrency: usize,

    /// Parallel workers for input preparation.
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    num_workers: usize,

    /// Drop pages that never emit the end marker.
    #[arg(long, env = "SKIP_REPEAT")]
    skip_repeat: bool,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF2TEXT_DPI", default_value_t = 144,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Max output tokens per page.
    #[arg(long, env = "PDF2TEXT_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Repetition guard n-gram size.
    #[arg(long, default_value_t = 20)]
    ngram_size: usize,

    /// Repetition guard search window.
    #[arg(long, default_value_t = 50)]
    window_size: usize,

    /// Token ids never suppressed by the guard.
    #[arg(long, value_delimiter = ',', default_value = "128821,128822")]
    whitelist: Vec<u32>,

    /// Marker emitted when a page terminates.
    #[arg(long, default_value = DEFAULT_EOS_MARKER)]
    eos_marker: String,

    /// Exclude pages whose input cannot be built instead of aborting.
    #[arg(long)]
    keep_going: bool,

    /// Normalise line endings and trim trailing whitespace of each page.
    #[arg(long)]
    tidy_whitespace: bool,

    /// Replace grounding spans with their label.
    #[arg(long)]
    strip_grounding: bool,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "PDF2TEXT_SEPARATOR", default_value = "none")]
    separator: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2TEXT_PASSWORD")]
    password: Option<String>,

    /// Retries per page on provider failure.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2TEXT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the `{"page_N": {"text": …}}` map instead of plain text.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress;
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

    // ── Engine ───────────────────────────────────────────────────────────
    let engine = match &cli.provider {
        Some(name) => {
            let model = cli.model.as_deref().unwrap_or("deepseek-ocr");
            ProviderEngine::from_name(name, model)
        }
        None => ProviderEngine::from_env(cli.model.as_deref()),
    }
    .context("Failed to set up the generation provider")?
    .with_retries(cli.max_retries, 500);
    let engine: Arc<dyn GenerationEngine> = Arc::new(engine);
    if !cli.quiet {
        if let Some(notice) = guard_notice(engine.as_ref()) {
            eprintln!("{} {}", cyan("⚠"), notice);
        }
    }

    // ── Config ───────────────────────────────────────────────────────────
    let progress: Option<Arc<dyn ProgressCallback>> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;

    // ── Run ──────────────────────────────────────────────────────────────
    if let Some(ref output_path) = cli.output {
        let stats = run_to_file(&cli.input, output_path, &config, engine)
            .await
            .context("OCR failed")?;
        if !cli.quiet {
            eprintln!(
                "{}  {}/{} pages  {}ms  →  {}",
                if stats.skipped_pages + stats.excluded_pages == 0 {
                    green("✔")
                } else {
                    cyan("⚠")
                },
                stats.kept_pages,
                stats.total_pages,
                stats.total_duration_ms,
                bold(&output_path.display().to_string()),
            );
            eprintln!("   {} tokens generated", dim(&stats.total_tokens.to_string()));
        }
    } else {
        let doc = run_file(&cli.input, &config, engine)
            .await
            .context("OCR failed")?;

        let body = if cli.json {
            serde_json::to_string_pretty(&doc.to_page_map_json())
                .context("Failed to serialise output")?
        } else {
            doc.assemble(&config.page_separator)
        };
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(body.as_bytes())
            .context("Failed to write to stdout")?;
        if !body.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }

        if !cli.quiet && !show_progress {
            eprintln!(
                "Kept {}/{} pages in {}ms ({} skipped, {} excluded)",
                doc.stats.kept_pages,
                doc.stats.total_pages,
                doc.stats.total_duration_ms,
                doc.stats.skipped_pages,
                doc.stats.excluded_pages,
            );
        }
    }

    Ok(())
}

/// Stderr notice for engines that cannot run the repetition guard.
fn guard_notice(engine: &dyn GenerationEngine) -> Option<String> {
    if engine.hosts_adjusters() {
        return None;
    }
    Some(format!(
        "engine '{}' decodes remotely: the n-gram repetition guard is not applied \
         here (--ngram-size/--window-size/--whitelist have no effect); configure \
         the server's own no-repeat-ngram setting",
        engine.name()
    ))
}

/// Map CLI args to `OcrConfig`.
fn build_config(cli: &Cli, progress: Option<Arc<dyn ProgressCallback>>) -> Result<OcrConfig> {
    let policy = if cli.keep_going {
        InputFailurePolicy::ExcludePage
    } else {
        InputFailurePolicy::Abort
    };

    let mut builder = OcrConfig::builder()
        .dpi(cli.dpi)
        .prompt(cli.prompt.clone())
        .crop_mode(cli.crop_mode)
        .max_concurrency(cli.max_concurrency)
        .num_workers(cli.num_workers)
        .skip_repeat(cli.skip_repeat)
        .max_tokens(cli.max_tokens)
        .ngram_size(cli.ngram_size)
        .window_size(cli.window_size)
        .whitelist(cli.whitelist.iter().copied())
        .eos_marker(cli.eos_marker.clone())
        .input_failure_policy(policy)
        .tidy_whitespace(cli.tidy_whitespace)
        .strip_grounding(cli.strip_grounding)
        .page_separator(parse_separator(&cli.separator))
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
