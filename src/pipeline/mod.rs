//! Pipeline stages for statement-to-Markdown processing.
//!
//! Each submodule implements exactly one transformation step. The
//! [`crate::orchestrator`] sequences them per document; none of them knows
//! about the others or about the chat boundary.
//!
//! ## Data Flow
//!
//! ```text
//! statement.pdf ──▶ render ──▶ encode ──▶ extract ──▶ parse ──▶ report
//!                  (pdfium)   (base64)   (vision LLM) (lines)   (Markdown)
//! ```
//!
//! 1. [`render`]  — rasterise every page into the staging directory; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 2. [`encode`]  — JPEG/PNG-encode bitmaps, base64-wrap staged images
//! 3. [`extract`] — one inference call per page; the only stage with network
//!    I/O
//! 4. [`parse`]   — tolerant `DATE|DESCRIPTION|AMOUNT` line parser
//! 5. [`report`]  — render and atomically persist the transaction table

pub mod encode;
pub mod extract;
pub mod parse;
pub mod render;
pub mod report;
