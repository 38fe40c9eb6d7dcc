//! Data types flowing through the pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One bank-statement transaction.
///
/// All three fields are non-empty after trimming; [`Transaction::new`] is the
/// only constructor that enforces it and the parser only builds through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Booking date, `DD.MM.YYYY` as emitted by the model.
    pub date: String,
    pub description: String,
    /// Amount exactly as printed, currency symbol and punctuation included.
    pub amount: String,
}

impl Transaction {
    /// Trim the three fields, returning `None` if any of them ends up empty.
    pub fn new(date: &str, description: &str, amount: &str) -> Option<Self> {
        let (date, description, amount) = (date.trim(), description.trim(), amount.trim());
        if date.is_empty() || description.is_empty() || amount.is_empty() {
            return None;
        }
        Some(Self {
            date: date.to_string(),
            description: description.to_string(),
            amount: amount.to_string(),
        })
    }
}

/// A rendered page staged on disk. `index` is 0-based in source page order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub index: usize,
    pub path: PathBuf,
}

/// Output of the rasterizer for one document.
#[derive(Debug, Clone, Default)]
pub struct RenderedDocument {
    /// Pages reported by the document itself.
    pub page_count: usize,
    /// Successfully rendered pages, ascending by index.
    pub pages: Vec<PageImage>,
    /// Pages that could not be rendered. Only populated under
    /// [`crate::config::PagePolicy::SkipFailed`].
    pub failed: Vec<OmittedPage>,
}

/// A page left out of the report, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedPage {
    /// 0-based page index.
    pub page: usize,
    pub reason: String,
}

/// Where the document bytes come from.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// A local file; it is copied into the staging directory.
    Path(PathBuf),
    /// Bytes already in memory (e.g. fetched by a chat transport).
    Bytes(Vec<u8>),
}

/// A document handed to the pipeline by the boundary.
#[derive(Debug, Clone)]
pub struct DocumentJob {
    /// Collision-resistant identifier, typically the transport's file id.
    /// Used to name the staging directory.
    pub document_id: String,
    pub source: DocumentSource,
}

impl DocumentJob {
    pub fn from_path(document_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            document_id: document_id.into(),
            source: DocumentSource::Path(path.into()),
        }
    }

    pub fn from_bytes(document_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            document_id: document_id.into(),
            source: DocumentSource::Bytes(bytes),
        }
    }
}

/// Result of a successfully processed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementReport {
    pub document_id: String,
    /// Pages in the source document.
    pub page_count: usize,
    /// Transactions in report order (page order, then line order).
    pub transactions: Vec<Transaction>,
    /// Pages missing from the report; always empty under the strict policy.
    pub omitted_pages: Vec<OmittedPage>,
    pub render_duration_ms: u64,
    pub extraction_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl StatementReport {
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_partial(&self) -> bool {
        !self.omitted_pages.is_empty()
    }
}
