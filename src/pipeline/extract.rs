//! Page extraction: one staged image in, the model's raw text out.
//!
//! [`ExtractionClient`] owns the fixed request shape (the system prompt from
//! [`crate::prompts`], temperature and token ceiling from the config) and
//! maps every backend failure to [`StatementError::Extraction`]. It performs
//! exactly one backend call per page; retries are the orchestrator's call.

use crate::backend::{ExtractionBackend, ExtractionRequest};
use crate::config::PipelineConfig;
use crate::error::StatementError;
use crate::pipeline::encode::encode_image;
use crate::prompts::{EXTRACTION_SYSTEM_PROMPT, PROMPT_VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone)]
pub struct ExtractionClient {
    backend: Arc<dyn ExtractionBackend>,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
}

impl ExtractionClient {
    pub fn new(backend: Arc<dyn ExtractionBackend>, config: &PipelineConfig) -> Self {
        Self {
            backend,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Send one page image and return the completion text.
    ///
    /// `page` is the 0-based page index, used only for error context.
    pub async fn extract(
        &self,
        page: usize,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, StatementError> {
        let start = Instant::now();
        let request = ExtractionRequest {
            system_prompt: EXTRACTION_SYSTEM_PROMPT.to_string(),
            image: encode_image(image_bytes, mime_type),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!(
            "Page {}: sending {} bytes to {} (prompt v{})",
            page + 1,
            image_bytes.len(),
            self.backend.name(),
            PROMPT_VERSION
        );

        let text = tokio::time::timeout(self.timeout, self.backend.complete(&request))
            .await
            .map_err(|_| StatementError::Extraction {
                page,
                detail: format!("timed out after {}s", self.timeout.as_secs_f32()),
            })?
            .map_err(|e| StatementError::Extraction {
                page,
                detail: e.to_string(),
            })?;

        if text.trim().is_empty() {
            return Err(StatementError::Extraction {
                page,
                detail: "backend returned an empty message".into(),
            });
        }

        debug!(
            "Page {}: {} chars in {:?}",
            page + 1,
            text.len(),
            start.elapsed()
        );
        Ok(text)
    }
}
