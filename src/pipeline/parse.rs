//! Parser for the `DATE|DESCRIPTION|AMOUNT` line protocol.
//!
//! The model is probabilistic and now and then adds commentary, blank lines
//! or half-finished rows. Parsing is therefore a filter followed by a
//! non-empty check:
//!
//! 1. [`filter_transactions`] keeps every line that splits on `|` into at
//!    least three fields whose first three are non-blank after trimming.
//!    Fields past the third are ignored. Everything else is dropped without
//!    an error.
//! 2. [`parse`] fails with [`StatementError::NoTransactions`] only when the
//!    filter kept nothing. [`parse_page`] does the same for one page's reply
//!    and names the page in the error.

use crate::error::StatementError;
use crate::model::Transaction;
use crate::prompts::FIELD_DELIMITER;
use tracing::debug;

/// Parse one line, or `None` if it does not follow the protocol.
pub fn parse_line(line: &str) -> Option<Transaction> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut fields = line.split(FIELD_DELIMITER);
    let (Some(date), Some(description), Some(amount)) = (fields.next(), fields.next(), fields.next())
    else {
        debug!("Invalid line format: {}", line);
        return None;
    };

    let parsed = Transaction::new(date, description, amount);
    if parsed.is_none() {
        debug!("Skipping invalid transaction line: {}", line);
    }
    parsed
}

/// All valid transactions in `text`, in line order. Never fails.
pub fn filter_transactions(text: &str) -> Vec<Transaction> {
    text.lines().filter_map(parse_line).collect()
}

/// Parse model output, failing if it contains no valid transaction at all.
pub fn parse(text: &str) -> Result<Vec<Transaction>, StatementError> {
    parse_checked(text, None)
}

/// [`parse`] for the reply to page `page` (0-based).
pub fn parse_page(page: usize, text: &str) -> Result<Vec<Transaction>, StatementError> {
    parse_checked(text, Some(page))
}

fn parse_checked(text: &str, page: Option<usize>) -> Result<Vec<Transaction>, StatementError> {
    let transactions = filter_transactions(text);
    if transactions.is_empty() {
        return Err(StatementError::NoTransactions { page });
    }
    debug!("Parsed {} transactions", transactions.len());
    Ok(transactions)
}
