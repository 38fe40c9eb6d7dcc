//! # statement2md
//!
//! Extract bank-statement transactions from scanned PDFs using Vision
//! Language Models and deliver them as a Markdown table.
//!
//! ## Why a vision model?
//!
//! Scanned statements carry no text layer, and every bank lays out its
//! tables differently. Instead of OCR plus per-bank layout rules, each page
//! is rasterised and a vision model reads it with a fixed instruction that
//! asks for one `DATE|DESCRIPTION|AMOUNT` line per transaction. A tolerant
//! parser keeps the valid lines and drops the noise.
//!
//! ## Pipeline Overview
//!
//! ```text
//! DocumentJob
//!  │
//!  ├─ 1. Stage      per-document directory under the staging root
//!  ├─ 2. Render     rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Extract    one vision call per page (Azure OpenAI or edgequake-llm)
//!  ├─ 4. Parse      keep `DATE|DESCRIPTION|AMOUNT` lines, page order
//!  ├─ 5. Report     Markdown table, written atomically
//!  └─ 6. Deliver    hand the report (or one error message) to the boundary
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use statement2md::{
//!     AzureOpenAiBackend, DocumentJob, NoopDelivery, Pipeline, PipelineConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // INFERENCE_ENDPOINT / INFERENCE_KEY / INFERENCE_DEPLOYMENT
//!     let config = Arc::new(PipelineConfig::from_env()?);
//!     let backend = AzureOpenAiBackend::new(&config.inference, Duration::from_secs(120))?;
//!     let pipeline = Pipeline::new(config, Arc::new(backend));
//!
//!     let job = DocumentJob::from_path("march", "statement.pdf");
//!     let report = pipeline
//!         .run(&job, &NoopDelivery, &CancellationToken::new())
//!         .await?;
//!     for t in &report.transactions {
//!         println!("{} {} {}", t.date, t.description, t.amount);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `statement2md` binary (clap + anyhow + tracing-subscriber + dotenvy) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! statement2md = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod delivery;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod staging;
pub mod transport;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{AzureOpenAiBackend, BackendError, ExtractionBackend, LlmProviderBackend};
pub use config::{PageImageFormat, PagePolicy, PipelineConfig, PipelineConfigBuilder};
pub use delivery::{Delivery, NoopDelivery, ProgressNotice};
pub use error::{Stage, StatementError};
pub use model::{DocumentJob, DocumentSource, OmittedPage, StatementReport, Transaction};
pub use orchestrator::{Pipeline, PipelineState};
pub use pipeline::parse::parse;
pub use pipeline::render::{PdfiumRasterizer, Rasterizer};
