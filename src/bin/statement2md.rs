//! CLI binary for statement2md.
//!
//! A thin shim over the library crate: `convert` runs one local PDF with a
//! terminal [`Delivery`], `serve` runs the Telegram bot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use statement2md::transport::telegram::{self, TelegramApi};
use statement2md::{
    AzureOpenAiBackend, Delivery, DocumentJob, ExtractionBackend, LlmProviderBackend, PagePolicy,
    PageImageFormat, Pipeline, PipelineConfig, ProgressNotice, StatementError, StatementReport,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-4.1-mini";

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

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one statement, table on stdout
  statement2md convert march.pdf

  # Write the report to a file, keep going past unreadable pages
  statement2md convert march.pdf -o march.md --skip-failed-pages

  # JSON summary (transactions, omitted pages, timings)
  statement2md convert march.pdf --json > march.json

  # Any edgequake-llm provider instead of Azure OpenAI
  statement2md convert march.pdf --provider anthropic --model claude-sonnet-4-20250514

  # Run the Telegram bot
  TRANSPORT_TOKEN=123:abc statement2md serve

BACKEND SELECTION:
  Azure OpenAI is used when INFERENCE_ENDPOINT, INFERENCE_KEY and
  INFERENCE_DEPLOYMENT are all set and --provider is not given. Otherwise the
  edgequake-llm provider named by --provider (default: openai) is used, with
  its own API-key variable (OPENAI_API_KEY, ANTHROPIC_API_KEY, …).

ENVIRONMENT VARIABLES:
  DEBUG                   true/1: debug logs, keep staging directories
  INFERENCE_ENDPOINT      Azure OpenAI resource URL
  INFERENCE_KEY           Azure OpenAI api-key
  INFERENCE_DEPLOYMENT    Azure OpenAI deployment name
  INFERENCE_API_VERSION   Azure OpenAI API version (default 2024-06-01)
  TRANSPORT_TOKEN         Telegram bot token (serve)
  STAGING_ROOT            Directory for per-document working directories
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)

A .env file in the working directory is loaded first.
"#;

/// Extract bank-statement transactions from scanned PDFs with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "statement2md",
    version,
    about = "Extract bank-statement transactions from scanned PDFs with Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "STATEMENT2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "STATEMENT2MD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one PDF statement into a Markdown transaction table.
    Convert(ConvertArgs),
    /// Serve statements sent to the Telegram bot.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local PDF file.
    input: PathBuf,

    /// Write the Markdown report to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the report summary as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long)]
    no_progress: bool,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Telegram bot token.
    #[arg(long, env = "TRANSPORT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

/// Overrides on top of the environment configuration.
#[derive(Args, Debug)]
struct PipelineArgs {
    /// edgequake-llm provider: openai, anthropic, gemini, ollama, …
    #[arg(long, env = "STATEMENT2MD_PROVIDER")]
    provider: Option<String>,

    /// Model ID for --provider.
    #[arg(long, env = "STATEMENT2MD_MODEL")]
    model: Option<String>,

    /// Page extractions in flight per document (1 = sequential).
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Omit failed pages instead of failing the whole document.
    #[arg(long)]
    skip_failed_pages: bool,

    /// Retries per page on extraction failure.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-page inference timeout in seconds.
    #[arg(long)]
    api_timeout: Option<u64>,

    /// Longest edge of rendered pages in pixels.
    #[arg(long)]
    max_pixels: Option<u32>,

    /// Stage pages as PNG instead of JPEG.
    #[arg(long)]
    png: bool,

    /// Directory for per-document working directories.
    #[arg(long)]
    staging_root: Option<PathBuf>,

    /// Keep staging directories after processing.
    #[arg(long)]
    keep_staging: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let env_config = PipelineConfig::from_env().context("Invalid environment configuration")?;

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner provides the feedback in convert mode; keep library logs
    // to warnings unless asked for more.
    let spinner = match &cli.command {
        Command::Convert(args) => !cli.quiet && !args.no_progress && !args.json,
        Command::Serve(_) => false,
    };
    let filter = if cli.verbose || env_config.debug {
        "debug"
    } else if cli.quiet {
        "error"
    } else if spinner {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Convert(args) => run_convert(args, env_config, spinner, cli.quiet, cancel).await,
        Command::Serve(args) => run_serve(args, env_config, cancel).await,
    }
}

async fn run_convert(
    args: ConvertArgs,
    env_config: PipelineConfig,
    spinner: bool,
    quiet: bool,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    if !args.input.is_file() {
        anyhow::bail!("Input file not found: {}", args.input.display());
    }

    let config = build_config(env_config, &args.pipeline)?;
    let backend = build_backend(&config, &args.pipeline)?;
    let pipeline = Pipeline::new(Arc::new(config), backend);

    let document_id = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("statement")
        .to_string();
    let job = DocumentJob::from_path(document_id, &args.input);

    let delivery = ConsoleDelivery::new(spinner, quiet, args.output.clone(), args.json);
    match pipeline.run(&job, &delivery, &cancel).await {
        Ok(report) => {
            delivery.finish(&report, args.output.as_deref());
            Ok(ExitCode::SUCCESS)
        }
        // ConsoleDelivery already printed the message.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

async fn run_serve(
    args: ServeArgs,
    env_config: PipelineConfig,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let token = args
        .token
        .clone()
        .or_else(|| env_config.transport_token.clone())
        .context("TRANSPORT_TOKEN is not set")?;

    let config = build_config(env_config, &args.pipeline)?;
    info!("Staging root: {}", config.staging_root.display());
    let backend = build_backend(&config, &args.pipeline)?;
    let pipeline = Arc::new(Pipeline::new(Arc::new(config), backend));

    let api = Arc::new(TelegramApi::new(token).context("Failed to create Telegram client")?);
    telegram::serve(api, pipeline, cancel)
        .await
        .context("Telegram transport failed")?;
    Ok(ExitCode::SUCCESS)
}

/// Apply CLI overrides to the environment config.
fn build_config(env_config: PipelineConfig, args: &PipelineArgs) -> Result<PipelineConfig> {
    let mut builder = env_config.into_builder();

    if let Some(n) = args.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(n) = args.max_retries {
        builder = builder.max_retries(n);
    }
    if let Some(secs) = args.api_timeout {
        builder = builder.api_timeout_secs(secs);
    }
    if let Some(px) = args.max_pixels {
        builder = builder.max_rendered_pixels(px);
    }
    if let Some(ref root) = args.staging_root {
        builder = builder.staging_root(root.clone());
    }
    if args.skip_failed_pages {
        builder = builder.page_policy(PagePolicy::SkipFailed);
    }
    if args.png {
        builder = builder.image_format(PageImageFormat::Png);
    }
    if args.keep_staging {
        builder = builder.debug(true);
    }

    builder.build().context("Invalid configuration")
}

/// Azure OpenAI when fully configured and no provider was requested,
/// otherwise an edgequake-llm provider.
fn build_backend(config: &PipelineConfig, args: &PipelineArgs) -> Result<Arc<dyn ExtractionBackend>> {
    if args.provider.is_none() && config.inference.is_complete() {
        let backend = AzureOpenAiBackend::new(
            &config.inference,
            Duration::from_secs(config.api_timeout_secs),
        )
        .context("Failed to create Azure OpenAI backend")?;
        info!("Using Azure OpenAI backend");
        return Ok(Arc::new(backend));
    }

    let provider = args.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
    let model = args.model.as_deref().unwrap_or(DEFAULT_MODEL);
    let backend = LlmProviderBackend::from_factory(provider, model).with_context(|| {
        format!(
            "No inference backend available. Set INFERENCE_ENDPOINT, INFERENCE_KEY and \
             INFERENCE_DEPLOYMENT, or the API key for provider '{provider}'"
        )
    })?;
    info!("Using {} backend with model {}", provider, model);
    Ok(Arc::new(backend))
}

// ── Terminal delivery ────────────────────────────────────────────────────────

/// [`Delivery`] for one local conversion: spinner for progress, report to a
/// file or stdout, errors to stderr.
struct ConsoleDelivery {
    bar: Option<ProgressBar>,
    quiet: bool,
    output: Option<PathBuf>,
    json: bool,
}

impl ConsoleDelivery {
    fn new(spinner: bool, quiet: bool, output: Option<PathBuf>, json: bool) -> Self {
        let bar = spinner.then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
            );
            bar.set_prefix("statement2md");
            bar.set_message("Preparing…");
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        Self {
            bar,
            quiet,
            output,
            json,
        }
    }

    fn println(&self, line: String) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None if !self.quiet => eprintln!("{line}"),
            None => {}
        }
    }

    /// Final summary after a successful run.
    fn finish(&self, report: &StatementReport, output: Option<&Path>) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
        if self.quiet || self.json {
            return;
        }

        let target = output
            .map(|p| format!("  →  {}", bold(&p.display().to_string())))
            .unwrap_or_default();
        eprintln!(
            "{} {} transactions from {} pages  {}ms{}",
            if report.is_partial() {
                cyan("⚠")
            } else {
                green("✔")
            },
            bold(&report.transaction_count().to_string()),
            report.page_count,
            report.total_duration_ms,
            target
        );
        for omitted in &report.omitted_pages {
            eprintln!(
                "  {} page {} omitted: {}",
                red("✗"),
                omitted.page + 1,
                dim(&omitted.reason)
            );
        }
    }
}

#[async_trait]
impl Delivery for ConsoleDelivery {
    async fn notify(&self, notice: &ProgressNotice) {
        match (&self.bar, notice) {
            (Some(bar), ProgressNotice::PageExtracted { page, total }) => {
                bar.set_message(format!("Extracting transactions… page {page}/{total}"));
            }
            (Some(bar), ProgressNotice::PagesOmitted { .. }) => {
                bar.println(format!("{} {}", cyan("⚠"), notice));
            }
            (Some(bar), other) => bar.set_message(other.to_string()),
            (None, _) if !self.quiet => eprintln!("{}", dim(&notice.to_string())),
            (None, _) => {}
        }
    }

    async fn deliver_report(
        &self,
        path: &Path,
        report: &StatementReport,
    ) -> Result<(), StatementError> {
        let markdown = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StatementError::Delivery(format!("{}: {}", path.display(), e)))?;

        if let Some(ref output) = self.output {
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StatementError::Delivery(format!("{}: {}", parent.display(), e)))?;
            }
            tokio::fs::write(output, &markdown)
                .await
                .map_err(|e| StatementError::Delivery(format!("{}: {}", output.display(), e)))?;
        }

        let stdout_text = if self.json {
            serde_json::to_string_pretty(report)
                .map_err(|e| StatementError::Delivery(e.to_string()))?
        } else if self.output.is_none() {
            markdown
        } else {
            return Ok(());
        };

        let write = || -> io::Result<()> {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(stdout_text.as_bytes())?;
            if !stdout_text.ends_with('\n') {
                handle.write_all(b"\n")?;
            }
            handle.flush()
        };
        let written = match &self.bar {
            Some(bar) => bar.suspend(write),
            None => write(),
        };
        written.map_err(|e| StatementError::Delivery(format!("stdout: {e}")))
    }

    async fn deliver_error(&self, message: &str) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
        eprintln!("{} {}", red("✘"), message);
    }
}

impl Drop for ConsoleDelivery {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar {
            if !bar.is_finished() {
                bar.finish_and_clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_args() -> PipelineArgs {
        PipelineArgs {
            provider: None,
            model: None,
            concurrency: None,
            skip_failed_pages: false,
            max_retries: None,
            api_timeout: None,
            max_pixels: None,
            png: false,
            staging_root: None,
            keep_staging: false,
        }
    }

    #[test]
    fn cli_parses_convert() {
        let cli = Cli::try_parse_from([
            "statement2md",
            "convert",
            "march.pdf",
            "-o",
            "march.md",
            "--skip-failed-pages",
            "-c",
            "4",
        ])
        .unwrap();
        match cli.command {
            Command::Convert(args) => {
                assert_eq!(args.input, PathBuf::from("march.pdf"));
                assert_eq!(args.output, Some(PathBuf::from("march.md")));
                assert!(args.pipeline.skip_failed_pages);
                assert_eq!(args.pipeline.concurrency, Some(4));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn overrides_apply_on_top_of_env_config() {
        let mut args = pipeline_args();
        args.concurrency = Some(3);
        args.skip_failed_pages = true;
        args.png = true;
        args.keep_staging = true;

        let config = build_config(PipelineConfig::default(), &args).unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.page_policy, PagePolicy::SkipFailed);
        assert_eq!(config.image_format, PageImageFormat::Png);
        assert!(config.debug);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut args = pipeline_args();
        args.concurrency = Some(0);
        assert!(build_config(PipelineConfig::default(), &args).is_err());
    }
}
