//! The model-facing extraction protocol.
//!
//! [`EXTRACTION_SYSTEM_PROMPT`] is an output-format contract: the parser in
//! [`crate::pipeline::parse`] relies on its exact wording (one transaction per
//! line, `DATE|DESCRIPTION|AMOUNT`, no headers or markdown). Change the two
//! together and bump [`PROMPT_VERSION`].

/// Version of the prompt/parser pair, logged with every extraction call.
pub const PROMPT_VERSION: &str = "1";

/// Field delimiter the prompt asks the model to use.
pub const FIELD_DELIMITER: char = '|';

/// System instruction sent alongside every page image.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a bank statement analyzer. Extract transaction details from the bank statement image.
Format each transaction exactly as follows, one per line:
{DATE}|{DESCRIPTION}|{AMOUNT}

Rules:
1. DATE format: DD.MM.YYYY
2. DESCRIPTION: Keep original text, remove any extra spaces
3. AMOUNT: Include currency symbol if present
4. Do not include headers or any other text
5. Do not include table formatting or markdown
6. Each field must be separated by | character
7. Each transaction must be on a new line

Example output:
01.03.2024|PAYMENT TO SHOP|₸50.00
02.03.2024|ATM WITHDRAWAL|₸100.00
03.03.2024|ONLINE TRANSFER|₽500.00
04.03.2024|GROCERY STORE|₽1,500.00"#;
