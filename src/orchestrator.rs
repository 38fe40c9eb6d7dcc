//! Per-document orchestration: staging → rasterize → extract → parse →
//! report → deliver → release.
//!
//! ## Failure isolation
//!
//! [`Pipeline::run`] never panics on a stage failure and never lets one
//! document affect another. Whatever goes wrong is collapsed into a single
//! [`StatementError`], turned into one human-readable message for the
//! requester, and returned to the caller. The staging directory is removed
//! on every path unless diagnostic mode keeps it.
//!
//! ## Page ordering under concurrency
//!
//! With `concurrency > 1` page extractions complete in any order. Each result
//! lands in the slot of its source page, so the final transaction list is
//! always page order first, then line order within the page.
//!
//! ## State machine
//!
//! ```text
//! Received ─▶ Staged ─▶ Rasterized ─▶ Extracting(i/N) ─▶ Parsed ─▶ Reported ─▶ Released
//!     └──────────┴───────────┴──────────────┴──────────────┴──────────┴──────▶ Failed
//! ```

use crate::backend::ExtractionBackend;
use crate::config::{PageImageFormat, PagePolicy, PipelineConfig};
use crate::delivery::{Delivery, ProgressNotice};
use crate::error::{Stage, StatementError};
use crate::model::{
    DocumentJob, DocumentSource, OmittedPage, PageImage, StatementReport, Transaction,
};
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::parse::parse_page;
use crate::pipeline::render::{render_document, PdfiumRasterizer, Rasterizer};
use crate::pipeline::report::{self, REPORT_FILE_NAME};
use crate::staging::{StagingArea, StagingDir};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the staged copy of the incoming document.
pub const STAGED_DOCUMENT_NAME: &str = "statement.pdf";

// ── State machine ────────────────────────────────────────────────────────

/// Lifecycle of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Staged,
    Rasterized { pages: usize },
    /// `done` of `total` pages extracted.
    Extracting { done: usize, total: usize },
    Parsed { transactions: usize },
    Reported,
    Released,
    Failed(Stage),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Released | PipelineState::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Received => f.write_str("RECEIVED"),
            PipelineState::Staged => f.write_str("STAGED"),
            PipelineState::Rasterized { pages } => write!(f, "RASTERIZED({pages} pages)"),
            PipelineState::Extracting { done, total } => write!(f, "EXTRACTING({done}/{total})"),
            PipelineState::Parsed { transactions } => {
                write!(f, "PARSED({transactions} transactions)")
            }
            PipelineState::Reported => f.write_str("REPORTED"),
            PipelineState::Released => f.write_str("RELEASED"),
            PipelineState::Failed(stage) => write!(f, "FAILED({stage})"),
        }
    }
}

/// Logs every transition of one document.
struct StateTracker<'a> {
    document_id: &'a str,
    state: PipelineState,
}

impl<'a> StateTracker<'a> {
    fn new(document_id: &'a str) -> Self {
        Self {
            document_id,
            state: PipelineState::Received,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!("[{}] {} → {}", self.document_id, self.state, next);
        self.state = next;
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Processes statement documents end to end. Cheap to share behind an `Arc`;
/// every [`Pipeline::run`] call owns its own staging directory.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    staging: StagingArea,
    rasterizer: Arc<dyn Rasterizer>,
    client: ExtractionClient,
}

impl Pipeline {
    /// Pipeline with the pdfium rasterizer and the given inference backend.
    pub fn new(config: Arc<PipelineConfig>, backend: Arc<dyn ExtractionBackend>) -> Self {
        Self {
            staging: StagingArea::from_config(&config),
            rasterizer: Arc::new(PdfiumRasterizer::from_config(&config)),
            client: ExtractionClient::new(backend, &config),
            config,
        }
    }

    /// Replace the rasterizer.
    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    /// Replace the extraction client (e.g. to shorten its timeout).
    pub fn with_client(mut self, client: ExtractionClient) -> Self {
        self.client = client;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Process one document.
    ///
    /// On success the report has already been handed to `delivery`. On
    /// failure exactly one error message has been sent through
    /// [`Delivery::deliver_error`]; the error is returned as well so callers
    /// can log or map it.
    pub async fn run(
        &self,
        job: &DocumentJob,
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
    ) -> Result<StatementReport, StatementError> {
        let mut tracker = StateTracker::new(&job.document_id);
        info!("Processing document {}", job.document_id);

        match self.process(job, delivery, cancel, &mut tracker).await {
            Ok(report) => {
                info!(
                    "Document {}: {} transactions from {} pages in {}ms",
                    job.document_id,
                    report.transaction_count(),
                    report.page_count,
                    report.total_duration_ms
                );
                Ok(report)
            }
            Err(e) => {
                tracker.advance(PipelineState::Failed(e.stage()));
                error!("Document {}: {}", job.document_id, e);
                delivery.deliver_error(&e.user_message()).await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        job: &DocumentJob,
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
        tracker: &mut StateTracker<'_>,
    ) -> Result<StatementReport, StatementError> {
        ensure_not_cancelled(cancel)?;
        let staging = self.staging.acquire(&job.document_id).await?;

        let outcome = self
            .process_staged(job, &staging, delivery, cancel, tracker)
            .await;

        let path = staging.path().to_path_buf();
        match staging.release().await {
            Ok(()) if outcome.is_ok() => tracker.advance(PipelineState::Released),
            Ok(()) => {}
            // Logged only: the document already has its outcome.
            Err(e) => warn!("Could not release {}: {}", path.display(), e),
        }
        outcome
    }

    async fn process_staged(
        &self,
        job: &DocumentJob,
        staging: &StagingDir,
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
        tracker: &mut StateTracker<'_>,
    ) -> Result<StatementReport, StatementError> {
        let total_start = Instant::now();

        // ── Step 1: Stage the document ───────────────────────────────────
        let pdf_path = staging.file(STAGED_DOCUMENT_NAME);
        stage_document(&job.source, &pdf_path).await?;
        tracker.advance(PipelineState::Staged);
        delivery.notify(&ProgressNotice::Staged).await;

        // ── Step 2: Rasterize ────────────────────────────────────────────
        ensure_not_cancelled(cancel)?;
        let render_start = Instant::now();
        let rendered =
            render_document(Arc::clone(&self.rasterizer), &pdf_path, staging.path()).await?;
        let render_duration_ms = render_start.elapsed().as_millis() as u64;
        info!(
            "Rendered {}/{} pages in {}ms",
            rendered.pages.len(),
            rendered.page_count,
            render_duration_ms
        );
        tracker.advance(PipelineState::Rasterized {
            pages: rendered.page_count,
        });
        ensure_not_cancelled(cancel)?;
        delivery
            .notify(&ProgressNotice::Rasterized {
                pages: rendered.page_count,
            })
            .await;

        // ── Step 3: Extract + parse every page ───────────────────────────
        let mut failures = Failures::default();
        for omitted in &rendered.failed {
            failures.record(
                omitted.clone(),
                StatementError::Rasterization {
                    page: Some(omitted.page),
                    detail: omitted.reason.clone(),
                },
            );
        }

        let llm_start = Instant::now();
        let per_page = self
            .extract_pages(
                &rendered.pages,
                rendered.page_count,
                delivery,
                cancel,
                tracker,
                &mut failures,
            )
            .await?;
        let extraction_duration_ms = llm_start.elapsed().as_millis() as u64;

        // Every kept page has at least one transaction.
        if per_page.is_empty() {
            return Err(failures
                .into_first_error()
                .unwrap_or(StatementError::NoTransactions { page: None }));
        }
        let transactions: Vec<Transaction> = per_page.into_iter().flatten().collect();

        let omitted_pages = failures.omitted();
        if !omitted_pages.is_empty() {
            delivery
                .notify(&ProgressNotice::PagesOmitted {
                    pages: omitted_pages.iter().map(|p| p.page).collect(),
                })
                .await;
        }

        tracker.advance(PipelineState::Parsed {
            transactions: transactions.len(),
        });
        delivery
            .notify(&ProgressNotice::Parsed {
                transactions: transactions.len(),
            })
            .await;

        // ── Step 4: Write the report ─────────────────────────────────────
        let report_path = staging.file(REPORT_FILE_NAME);
        let markdown = report::render_with_omissions(&transactions, &omitted_pages);
        report::write_rendered(&markdown, &report_path).await?;
        tracker.advance(PipelineState::Reported);

        let report = StatementReport {
            document_id: job.document_id.clone(),
            page_count: rendered.page_count,
            transactions,
            omitted_pages,
            render_duration_ms,
            extraction_duration_ms,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };

        // ── Step 5: Deliver while the staging directory still exists ─────
        ensure_not_cancelled(cancel)?;
        delivery.deliver_report(&report_path, &report).await?;
        Ok(report)
    }

    /// Extract and parse every rendered page, returning per-page transactions
    /// in page order. Pages whose extraction or parsing fails under
    /// [`PagePolicy::SkipFailed`] are recorded in `failures` and left out.
    async fn extract_pages(
        &self,
        pages: &[PageImage],
        page_count: usize,
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
        tracker: &mut StateTracker<'_>,
        failures: &mut Failures,
    ) -> Result<Vec<Vec<Transaction>>, StatementError> {
        let mut slots: Vec<Option<Vec<Transaction>>> = vec![None; pages.len()];
        let mut done = 0;
        tracker.advance(PipelineState::Extracting {
            done,
            total: pages.len(),
        });

        let page_futures: Vec<_> = pages
            .iter()
            .enumerate()
            .map(|(slot, page)| async move { (slot, page.index, self.extract_page(page).await) })
            .collect();
        let mut results = stream::iter(page_futures).buffer_unordered(self.config.concurrency);

        loop {
            // In-flight calls are abandoned when the stream is dropped.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StatementError::Cancelled),
                next = results.next() => next,
            };
            let Some((slot, index, result)) = next else {
                break;
            };

            match result {
                Ok(transactions) => {
                    slots[slot] = Some(transactions);
                    done += 1;
                    tracker.advance(PipelineState::Extracting {
                        done,
                        total: pages.len(),
                    });
                    delivery
                        .notify(&ProgressNotice::PageExtracted {
                            page: index + 1,
                            total: page_count,
                        })
                        .await;
                }
                Err(e) => match page_failure_reason(&e) {
                    Some(reason) if self.config.page_policy == PagePolicy::SkipFailed => {
                        warn!("Omitting page {}: {}", index + 1, reason);
                        failures.record(
                            OmittedPage {
                                page: index,
                                reason,
                            },
                            e,
                        );
                    }
                    _ => return Err(e),
                },
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// One page: read the staged image, call the backend (with retries),
    /// parse the reply. A reply without a single valid line fails the page.
    async fn extract_page(&self, page: &PageImage) -> Result<Vec<Transaction>, StatementError> {
        let bytes = tokio::fs::read(&page.path)
            .await
            .map_err(|e| StatementError::staging(&page.path, e))?;
        let mime_type = PageImageFormat::from_path(&page.path)
            .unwrap_or(self.config.image_format)
            .mime_type();

        let text = self.extract_with_retry(page.index, &bytes, mime_type).await?;
        let transactions = parse_page(page.index, &text)?;
        debug!(
            "Page {}: {} transactions",
            page.index + 1,
            transactions.len()
        );
        Ok(transactions)
    }

    /// Exponential backoff around [`ExtractionClient::extract`]:
    /// `retry_backoff_ms * 2^(attempt-1)`. With `max_retries = 0` this is a
    /// single call.
    async fn extract_with_retry(
        &self,
        page: usize,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, StatementError> {
        let mut attempt: u32 = 0;
        loop {
            match self.client.extract(page, bytes, mime_type).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self
                        .config
                        .retry_backoff_ms
                        .saturating_mul(2u64.saturating_pow(attempt - 1));
                    warn!(
                        "Page {}: attempt {} failed ({}), retry {}/{} after {}ms",
                        page + 1,
                        attempt,
                        e,
                        attempt,
                        self.config.max_retries,
                        backoff
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Copy or write the incoming document into the staging directory.
async fn stage_document(source: &DocumentSource, dest: &Path) -> Result<(), StatementError> {
    match source {
        DocumentSource::Path(src) => {
            tokio::fs::copy(src, dest)
                .await
                .map_err(|e| StatementError::staging(src, e))?;
        }
        DocumentSource::Bytes(bytes) => {
            tokio::fs::write(dest, bytes)
                .await
                .map_err(|e| StatementError::staging(dest, e))?;
        }
    }
    debug!("Staged document at {}", dest.display());
    Ok(())
}

/// Why a page can be left out under [`PagePolicy::SkipFailed`], or `None`
/// for errors that always fail the document.
fn page_failure_reason(error: &StatementError) -> Option<String> {
    match error {
        StatementError::Extraction { detail, .. } => Some(detail.clone()),
        StatementError::NoTransactions { page: Some(_) } => {
            Some("no valid transactions in model output".to_string())
        }
        _ => None,
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), StatementError> {
    if cancel.is_cancelled() {
        return Err(StatementError::Cancelled);
    }
    Ok(())
}

/// Pages left out under [`PagePolicy::SkipFailed`], plus the error of the
/// lowest failed page for when nothing at all succeeded.
#[derive(Default)]
struct Failures {
    omitted: Vec<OmittedPage>,
    first: Option<(usize, StatementError)>,
}

impl Failures {
    fn record(&mut self, page: OmittedPage, error: StatementError) {
        if self.first.as_ref().is_none_or(|(p, _)| page.page < *p) {
            self.first = Some((page.page, error));
        }
        self.omitted.push(page);
    }

    fn omitted(&self) -> Vec<OmittedPage> {
        let mut pages = self.omitted.clone();
        pages.sort_by_key(|p| p.page);
        pages
    }

    fn into_first_error(self) -> Option<StatementError> {
        self.first.map(|(_, e)| e)
    }
}
