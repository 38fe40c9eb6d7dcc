//! Error types for the statement2md library.
//!
//! Every stage of the per-document pipeline fails fast with a
//! [`StatementError`]. The orchestrator catches it at the document boundary,
//! turns it into exactly one human-readable message via
//! [`StatementError::user_message`] and keeps serving other documents.
//!
//! [`Stage`] names the part of the pipeline that failed so the message a
//! requester sees always starts with where things went wrong.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    Staging,
    Rasterization,
    Extraction,
    Parsing,
    Report,
    Delivery,
    Configuration,
    Internal,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Staging => "Staging",
            Stage::Rasterization => "Rasterization",
            Stage::Extraction => "Extraction",
            Stage::Parsing => "Parsing",
            Stage::Report => "Report generation",
            Stage::Delivery => "Delivery",
            Stage::Configuration => "Configuration",
            Stage::Internal => "Processing",
        };
        f.write_str(name)
    }
}

/// All errors returned by the statement2md library.
#[derive(Debug, Error)]
pub enum StatementError {
    // ── Staging ───────────────────────────────────────────────────────────
    /// The per-document working directory could not be created, populated
    /// or removed.
    #[error("staging directory '{path}': {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Rasterization ─────────────────────────────────────────────────────
    /// The staged document does not start with the `%PDF` magic bytes.
    #[error("'{path}' is not a PDF document (first bytes: {magic:?})")]
    NotAPdf { path: PathBuf, magic: Vec<u8> },

    /// pdfium could not open the document or render one of its pages.
    /// `page` is 0-based and absent when the whole document is unreadable.
    #[error("{}", rasterization_message(.page, .detail))]
    Rasterization { page: Option<usize>, detail: String },

    /// No pdfium library could be bound.
    #[error("failed to bind pdfium library: {0}\nSet PDFIUM_LIB_PATH=/path/to/libpdfium.")]
    PdfiumBinding(String),

    // ── Extraction ────────────────────────────────────────────────────────
    /// The inference backend was unreachable, timed out, or answered with
    /// no usable text. `page` is 0-based.
    #[error("page {}: {detail}", .page + 1)]
    Extraction { page: usize, detail: String },

    // ── Parsing ───────────────────────────────────────────────────────────
    /// Not a single line of the model output matched the
    /// `DATE|DESCRIPTION|AMOUNT` protocol. `page` is 0-based and absent when
    /// the text is not tied to one page (or the document has no pages).
    #[error("{}", no_transactions_message(.page))]
    NoTransactions { page: Option<usize> },

    // ── Report ────────────────────────────────────────────────────────────
    /// The report could not be persisted.
    #[error("failed to write report '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Boundary ──────────────────────────────────────────────────────────
    /// The finished report could not be handed back to the requester.
    #[error("could not deliver report: {0}")]
    Delivery(String),

    /// Processing was cancelled from outside before it completed.
    #[error("processing cancelled")]
    Cancelled,

    // ── Config ────────────────────────────────────────────────────────────
    /// Builder or environment validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error (e.g. a panicked blocking task).
    #[error("internal error: {0}")]
    Internal(String),
}

fn rasterization_message(page: &Option<usize>, detail: &str) -> String {
    match page {
        Some(p) => format!("page {} could not be rendered: {}", p + 1, detail),
        None => format!("document could not be opened: {}", detail),
    }
}

fn no_transactions_message(page: &Option<usize>) -> String {
    match page {
        Some(p) => format!("page {}: no valid transactions in model output", p + 1),
        None => "no valid transactions found in model output".to_string(),
    }
}

impl StatementError {
    /// Stage the error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            StatementError::Staging { .. } => Stage::Staging,
            StatementError::NotAPdf { .. }
            | StatementError::Rasterization { .. }
            | StatementError::PdfiumBinding(_) => Stage::Rasterization,
            StatementError::Extraction { .. } => Stage::Extraction,
            StatementError::NoTransactions { .. } => Stage::Parsing,
            StatementError::Write { .. } => Stage::Report,
            StatementError::Delivery(_) => Stage::Delivery,
            StatementError::InvalidConfig(_) => Stage::Configuration,
            StatementError::Cancelled | StatementError::Internal(_) => Stage::Internal,
        }
    }

    /// The single message surfaced to the requester of a failed document.
    pub fn user_message(&self) -> String {
        format!("{} failed: {}", self.stage(), self)
    }

    /// Whether a retry wrapper may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StatementError::Extraction { .. })
    }

    pub(crate) fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StatementError::Staging {
            path: path.into(),
            source,
        }
    }
}
