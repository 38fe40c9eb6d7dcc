//! End-to-end tests for statement2md.
//!
//! These tests render real PDF files from `./test_cases/` with pdfium and
//! make live vision-model calls. They are gated behind the `E2E_ENABLED`
//! environment variable so they do not run in CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=. cargo test --test e2e -- --nocapture
//!
//! The live conversion uses Azure OpenAI when `INFERENCE_ENDPOINT`,
//! `INFERENCE_KEY` and `INFERENCE_DEPLOYMENT` are set, otherwise OpenAI via
//! `OPENAI_API_KEY`.

use async_trait::async_trait;
use statement2md::backend::{BackendError, ExtractionBackend, ExtractionRequest};
use statement2md::pipeline::render::Rasterizer;
use statement2md::{
    AzureOpenAiBackend, DocumentJob, LlmProviderBackend, NoopDelivery, PdfiumRasterizer,
    Pipeline, PipelineConfig, StatementError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* no PDF file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP — set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP — test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// Backend for runs that must never reach inference.
struct UnreachableBackend;

#[async_trait]
impl ExtractionBackend for UnreachableBackend {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn complete(&self, _request: &ExtractionRequest) -> Result<String, BackendError> {
        panic!("inference must not be called");
    }
}

fn config_for(staging: &TempDir) -> PipelineConfig {
    let base = PipelineConfig::from_env().unwrap_or_default();
    base.into_builder()
        .staging_root(staging.path())
        .build()
        .unwrap()
}

fn live_backend(config: &PipelineConfig) -> Option<Arc<dyn ExtractionBackend>> {
    if config.inference.is_complete() {
        let backend = AzureOpenAiBackend::new(&config.inference, Duration::from_secs(120)).ok()?;
        return Some(Arc::new(backend));
    }
    if std::env::var("OPENAI_API_KEY").is_ok() {
        let backend = LlmProviderBackend::from_factory("openai", "gpt-4.1-mini").ok()?;
        return Some(Arc::new(backend));
    }
    None
}

// ── Rasterization (no API calls) ─────────────────────────────────────────────

#[test]
fn test_rasterize_statement_pages() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("statement.pdf"));
    let staging = TempDir::new().unwrap();
    let config = config_for(&staging);

    let out = staging.path().join("pages");
    std::fs::create_dir_all(&out).unwrap();
    let rendered = PdfiumRasterizer::from_config(&config)
        .render(&pdf, &out)
        .expect("statement renders");

    assert!(rendered.page_count >= 1);
    assert_eq!(rendered.pages.len(), rendered.page_count);
    for (i, page) in rendered.pages.iter().enumerate() {
        assert_eq!(page.index, i);
        let img = image::open(&page.path).expect("page image decodes");
        assert!(img.width().max(img.height()) <= config.max_rendered_pixels);
    }
}

/// Runs without pdfium: the magic-byte check rejects the file first.
#[tokio::test]
async fn test_non_pdf_is_rejected_before_inference() {
    let staging = TempDir::new().unwrap();
    let config = PipelineConfig::builder()
        .staging_root(staging.path().join("staging"))
        .build()
        .unwrap();
    let pipeline = Pipeline::new(Arc::new(config), Arc::new(UnreachableBackend));

    let job = DocumentJob::from_bytes("photo", b"\x89PNG\r\n\x1a\n".to_vec());
    let err = pipeline
        .run(&job, &NoopDelivery, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, StatementError::NotAPdf { .. }), "got: {err}");
    assert!(err.user_message().starts_with("Rasterization failed"));
}

// ── Live conversion ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_convert_statement_live() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("statement.pdf"));
    let staging = TempDir::new().unwrap();
    let config = config_for(&staging);
    let Some(backend) = live_backend(&config) else {
        println!("SKIP — no inference credentials configured");
        return;
    };

    let pipeline = Pipeline::new(Arc::new(config), backend);
    let report = pipeline
        .run(
            &DocumentJob::from_path("statement", &pdf),
            &NoopDelivery,
            &CancellationToken::new(),
        )
        .await
        .expect("conversion succeeds");

    println!(
        "{} transactions from {} page(s) in {} ms",
        report.transaction_count(),
        report.page_count,
        report.total_duration_ms
    );
    assert!(report.transaction_count() > 0);
    for t in &report.transactions {
        assert!(!t.date.is_empty() && !t.description.is_empty() && !t.amount.is_empty());
        assert!(!t.description.contains('|'));
    }
}
