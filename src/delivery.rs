//! The boundary the pipeline reports back through.
//!
//! A [`Delivery`] is the opaque "where did this document come from" context:
//! a chat conversation, a terminal, a test recorder. The orchestrator sends
//! it best-effort [`ProgressNotice`]s while working and then exactly one of
//! a report or an error message.
//!
//! Notices arrive while work is still running, and the report path handed
//! to [`Delivery::deliver_report`] is only valid until the call returns.

use crate::error::StatementError;
use crate::model::StatementReport;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;

/// Non-authoritative progress information for a human operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressNotice {
    /// The document is staged and processing has started.
    Staged,
    /// Rasterisation finished; extraction is about to start.
    Rasterized { pages: usize },
    /// One page has been extracted (1-based `page`).
    PageExtracted { page: usize, total: usize },
    /// Some pages were left out of the report (0-based indices).
    PagesOmitted { pages: Vec<usize> },
    /// All responses parsed; the report is being generated.
    Parsed { transactions: usize },
}

impl fmt::Display for ProgressNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressNotice::Staged => f.write_str("Processing your bank statement..."),
            ProgressNotice::Rasterized { .. } => {
                f.write_str("Extracting transactions from images...")
            }
            ProgressNotice::PageExtracted { page, total } => {
                write!(f, "Page {page}/{total} extracted.")
            }
            ProgressNotice::PagesOmitted { pages } => {
                let list: Vec<String> = pages.iter().map(|p| (p + 1).to_string()).collect();
                write!(
                    f,
                    "Warning: page(s) {} could not be processed and will be missing from the report.",
                    list.join(", ")
                )
            }
            ProgressNotice::Parsed { transactions } => {
                write!(f, "Found {transactions} transactions. Generating report...")
            }
        }
    }
}

/// Channel back to whoever submitted a document.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Best-effort progress update. Failures must be swallowed (and logged)
    /// by the implementation; they never affect the pipeline outcome.
    async fn notify(&self, notice: &ProgressNotice);

    /// Hand over the finished report. `path` is only valid for the duration
    /// of the call; the staging directory is released afterwards.
    async fn deliver_report(
        &self,
        path: &Path,
        report: &StatementReport,
    ) -> Result<(), StatementError>;

    /// Surface the single human-readable error of a failed document.
    async fn deliver_error(&self, message: &str);
}

/// A delivery that drops everything. Useful for library callers that only
/// want the returned [`StatementReport`].
pub struct NoopDelivery;

#[async_trait]
impl Delivery for NoopDelivery {
    async fn notify(&self, _notice: &ProgressNotice) {}

    async fn deliver_report(
        &self,
        _path: &Path,
        _report: &StatementReport,
    ) -> Result<(), StatementError> {
        Ok(())
    }

    async fn deliver_error(&self, _message: &str) {}
}
