//! Markdown report rendering and persistence.
//!
//! The report is a title, a three-column table header and one row per
//! transaction, in exactly the order given. No sorting, grouping or
//! deduplication happens here.

use crate::error::StatementError;
use crate::model::{OmittedPage, Transaction};
use std::fmt::Write as _;
use std::path::Path;
use tracing::debug;

pub const REPORT_TITLE: &str = "# Bank Statement Transactions";
pub const REPORT_FILE_NAME: &str = "transactions.md";

const TABLE_HEADER: &str = "| Date | Description | Amount |\n|------|-------------|--------|\n";

/// Render transactions as a Markdown table.
pub fn render(transactions: &[Transaction]) -> String {
    let mut out = String::with_capacity(64 + transactions.len() * 48);
    out.push_str(REPORT_TITLE);
    out.push_str("\n\n");
    out.push_str(TABLE_HEADER);
    for t in transactions {
        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "| {} | {} | {} |",
            escape_cell(&t.date),
            escape_cell(&t.description),
            escape_cell(&t.amount)
        );
    }
    out
}

/// Render transactions plus a footer naming pages that were left out.
///
/// With no omitted pages this is identical to [`render`].
pub fn render_with_omissions(transactions: &[Transaction], omitted: &[OmittedPage]) -> String {
    let mut out = render(transactions);
    if omitted.is_empty() {
        return out;
    }

    let pages: Vec<String> = omitted.iter().map(|p| (p.page + 1).to_string()).collect();
    let _ = write!(
        out,
        "\n> **Incomplete report:** page(s) {} could not be processed and are not included.\n",
        pages.join(", ")
    );
    out
}

/// Render and persist `transactions` at `path`.
pub async fn write(transactions: &[Transaction], path: &Path) -> Result<(), StatementError> {
    write_rendered(&render(transactions), path).await
}

/// Persist already-rendered Markdown atomically (temp file, then rename), so
/// a reader never sees a half-written report.
pub async fn write_rendered(markdown: &str, path: &Path) -> Result<(), StatementError> {
    let write_err = |source| StatementError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, markdown)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    debug!("Wrote report ({} bytes) to {}", markdown.len(), path.display());
    Ok(())
}

/// A literal `|` inside a cell would split the row; escape it. Parsed
/// transactions never contain one (the parser splits on it), so this only
/// matters for transactions built directly by library callers.
fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|")
}
