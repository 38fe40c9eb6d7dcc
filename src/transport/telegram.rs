//! Telegram Bot API transport.
//!
//! Long-polls `getUpdates`, downloads every incoming document and runs it
//! through the pipeline in its own task. Progress notices, the report file
//! and error messages go back to the chat the document came from.
//!
//! ## Bot API surface
//!
//! `getMe`, `getUpdates`, `getFile`, `sendMessage` and `sendDocument`, plus
//! the file download endpoint, over plain `reqwest` + `serde`.

use crate::delivery::{Delivery, ProgressNotice};
use crate::error::StatementError;
use crate::model::{DocumentJob, StatementReport};
use crate::orchestrator::Pipeline;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Long-poll duration passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 60;
/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Timeout for every call except the long poll.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const HELP_TEXT: &str = "Send me a bank statement as a PDF document and I will reply with a \
Markdown table of its transactions.";

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    /// Network or decoding failure. The URL (which contains the bot token)
    /// is stripped before the error is stored.
    #[error("Telegram request failed: {0}")]
    Request(reqwest::Error),

    /// The Bot API answered `ok: false`.
    #[error("Telegram API error ({status}): {description}")]
    Api {
        status: StatusCode,
        description: String,
    },
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Request(e.without_url())
    }
}

// ── Bot API types ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub document: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    pub username: Option<String>,
}

impl User {
    fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.first_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub file_id: String,
    pub file_path: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────────

/// Minimal Bot API client.
#[derive(Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl fmt::Debug for TelegramApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramApi")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl TelegramApi {
    pub fn new(token: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_base_url(token, DEFAULT_API_BASE)
    }

    /// Client against a custom Bot API server.
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url, self.token, file_path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
        let status = response.status();
        let body: ApiResponse<T> = response.json().await?;
        match (body.ok, body.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TransportError::Api {
                status,
                description: body
                    .description
                    .unwrap_or_else(|| "response without result".to_string()),
            }),
        }
    }

    pub async fn get_me(&self) -> Result<User, TransportError> {
        let response = self.http.get(self.method_url("getMe")).send().await?;
        Self::decode(response).await
    }

    /// Long-poll for updates with id ≥ `offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        let response = self
            .http
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS) + REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<File, TransportError> {
        let response = self
            .http
            .get(self.method_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Resolve a `file_id` and download its bytes.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, TransportError> {
        let file = self.get_file(file_id).await?;
        let file_path = file.file_path.ok_or_else(|| TransportError::Api {
            status: StatusCode::OK,
            description: format!("file {file_id} has no download path"),
        })?;

        debug!("Downloading file {}", file_id);
        let response = self.http.get(self.file_url(&file_path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Api {
                status,
                description: format!("download of file {file_id} failed"),
            });
        }
        let bytes = response.bytes().await?;
        info!("Downloaded file {} ({} bytes)", file_id, bytes.len());
        Ok(bytes.to_vec())
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .form(&[("chat_id", chat_id.to_string()), ("text", text.to_string())])
            .send()
            .await?;
        Self::decode::<serde_json::Value>(response).await?;
        Ok(())
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        contents: Vec<u8>,
        caption: &str,
    ) -> Result<(), TransportError> {
        let part = Part::bytes(contents)
            .file_name(file_name.to_string())
            .mime_str("text/markdown")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        Self::decode::<serde_json::Value>(response).await?;
        Ok(())
    }
}

// ── Delivery ─────────────────────────────────────────────────────────────

/// [`Delivery`] into one Telegram chat.
pub struct TelegramDelivery {
    api: Arc<TelegramApi>,
    chat_id: i64,
}

impl TelegramDelivery {
    pub fn new(api: Arc<TelegramApi>, chat_id: i64) -> Self {
        Self { api, chat_id }
    }
}

/// Text sent to the chat for a notice; per-page progress stays in the logs.
fn chat_text(notice: &ProgressNotice) -> Option<String> {
    match notice {
        ProgressNotice::PageExtracted { .. } => None,
        other => Some(other.to_string()),
    }
}

fn report_caption(report: &StatementReport) -> String {
    let mut caption = format!(
        "{} transactions from {} page(s).",
        report.transaction_count(),
        report.page_count
    );
    if report.is_partial() {
        caption.push_str(&format!(
            " {} page(s) could not be processed.",
            report.omitted_pages.len()
        ));
    }
    caption
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn notify(&self, notice: &ProgressNotice) {
        let Some(text) = chat_text(notice) else {
            debug!("chat {}: {}", self.chat_id, notice);
            return;
        };
        if let Err(e) = self.api.send_message(self.chat_id, &text).await {
            warn!("Could not send progress to chat {}: {}", self.chat_id, e);
        }
    }

    async fn deliver_report(
        &self,
        path: &Path,
        report: &StatementReport,
    ) -> Result<(), StatementError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| StatementError::Delivery(format!("{}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("transactions.md");

        self.api
            .send_document(self.chat_id, file_name, contents, &report_caption(report))
            .await
            .map_err(|e| StatementError::Delivery(e.to_string()))?;
        info!("Sent report to chat {}", self.chat_id);
        Ok(())
    }

    async fn deliver_error(&self, message: &str) {
        if let Err(e) = self.api.send_message(self.chat_id, message).await {
            error!("Could not send error to chat {}: {}", self.chat_id, e);
        }
    }
}

// ── Update loop ──────────────────────────────────────────────────────────

/// Serve until `cancel` fires. Every document runs in its own task; a failed
/// document never stops the loop. In-flight documents are awaited on
/// shutdown (they observe the same token and stop early).
pub async fn serve(
    api: Arc<TelegramApi>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let me = api.get_me().await?;
    info!("Bot authorized on account {}", me.display_name());

    let mut offset: i64 = 0;
    let mut tasks = JoinSet::new();

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = api.get_updates(offset) => polled,
        };

        let updates = match polled {
            Ok(updates) => updates,
            Err(e) => {
                warn!("getUpdates failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };

            if let Some(document) = message.document.clone() {
                let from = message
                    .from
                    .as_ref()
                    .map(|u| u.display_name().to_string())
                    .unwrap_or_default();
                info!(
                    "Received document {} from {} in chat {}",
                    document.file_name.as_deref().unwrap_or("<unnamed>"),
                    from,
                    message.chat.id
                );
                tasks.spawn(handle_document(
                    Arc::clone(&api),
                    Arc::clone(&pipeline),
                    message.chat.id,
                    document,
                    cancel.clone(),
                ));
            } else if is_help_command(message.text.as_deref()) {
                if let Err(e) = api.send_message(message.chat.id, HELP_TEXT).await {
                    warn!("Could not answer chat {}: {}", message.chat.id, e);
                }
            }
        }

        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Document task aborted: {}", e);
            }
        }
    }

    info!("Shutting down; waiting for {} document(s)", tasks.len());
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            error!("Document task aborted: {}", e);
        }
    }
    Ok(())
}

async fn handle_document(
    api: Arc<TelegramApi>,
    pipeline: Arc<Pipeline>,
    chat_id: i64,
    document: Document,
    cancel: CancellationToken,
) {
    let delivery = TelegramDelivery::new(Arc::clone(&api), chat_id);

    let bytes = match api.download(&document.file_id).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Download of {} failed: {}", document.file_id, e);
            delivery
                .deliver_error(&format!("Download failed: {e}"))
                .await;
            return;
        }
    };

    let job = DocumentJob::from_bytes(document.file_id, bytes);
    // Outcome already delivered to the chat.
    let _ = pipeline.run(&job, &delivery, &cancel).await;
}

fn is_help_command(text: Option<&str>) -> bool {
    let Some(command) = text.and_then(|t| t.split_whitespace().next()) else {
        return false;
    };
    let command = command.split('@').next().unwrap_or(command);
    matches!(command, "/start" | "/help")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OmittedPage;

    #[test]
    fn updates_deserialize() {
        let json = r#"{
            "ok": true,
            "result": [
                {"update_id": 10, "message": {
                    "message_id": 1, "date": 1700000000,
                    "chat": {"id": 42, "type": "private"},
                    "from": {"id": 7, "is_bot": false, "first_name": "Ann", "username": "ann"},
                    "document": {"file_id": "BQAC-xyz", "file_unique_id": "u1",
                                 "file_name": "march.pdf", "mime_type": "application/pdf",
                                 "file_size": 12345}
                }},
                {"update_id": 11, "edited_message": {"message_id": 2}},
                {"update_id": 12, "message": {
                    "message_id": 3, "chat": {"id": 42}, "text": "/start"
                }}
            ]
        }"#;
        let body: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        let updates = body.result.unwrap();
        assert_eq!(updates.len(), 3);

        let doc = updates[0].message.as_ref().unwrap().document.as_ref().unwrap();
        assert_eq!(doc.file_id, "BQAC-xyz");
        assert_eq!(doc.file_size, Some(12345));
        assert_eq!(
            updates[0].message.as_ref().unwrap().from.as_ref().unwrap().display_name(),
            "ann"
        );
        assert!(updates[1].message.is_none());
        assert_eq!(
            updates[2].message.as_ref().unwrap().text.as_deref(),
            Some("/start")
        );
    }

    #[test]
    fn api_error_body_deserializes() {
        let body: ApiResponse<Vec<Update>> = serde_json::from_str(
            r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#,
        )
        .unwrap();
        assert!(!body.ok);
        assert!(body.result.is_none());
        assert_eq!(body.description.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn urls_embed_token_but_debug_redacts_it() {
        let api = TelegramApi::with_base_url("123:abc", "https://example.test/").unwrap();
        assert_eq!(api.method_url("getMe"), "https://example.test/bot123:abc/getMe");
        assert_eq!(
            api.file_url("documents/file_1.pdf"),
            "https://example.test/file/bot123:abc/documents/file_1.pdf"
        );
        assert!(!format!("{api:?}").contains("123:abc"));
    }

    #[test]
    fn page_progress_is_not_sent_to_chat() {
        assert!(chat_text(&ProgressNotice::PageExtracted { page: 1, total: 2 }).is_none());
        assert_eq!(
            chat_text(&ProgressNotice::Staged).as_deref(),
            Some("Processing your bank statement...")
        );
    }

    #[test]
    fn caption_mentions_omitted_pages() {
        let mut report = StatementReport {
            document_id: "doc".into(),
            page_count: 3,
            transactions: vec![],
            omitted_pages: vec![],
            render_duration_ms: 0,
            extraction_duration_ms: 0,
            total_duration_ms: 0,
        };
        assert_eq!(report_caption(&report), "0 transactions from 3 page(s).");
        report.omitted_pages.push(OmittedPage {
            page: 2,
            reason: "timeout".into(),
        });
        assert!(report_caption(&report).ends_with("1 page(s) could not be processed."));
    }

    #[test]
    fn help_commands() {
        assert!(is_help_command(Some("/start")));
        assert!(is_help_command(Some("/help@statement_bot please")));
        assert!(!is_help_command(Some("hello")));
        assert!(!is_help_command(None));
    }
}
