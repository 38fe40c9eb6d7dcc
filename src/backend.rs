//! Inference backends: the black box that turns (prompt, image) into text.
//!
//! [`ExtractionBackend`] is the seam between the pipeline and whatever hosts
//! the vision model. Two implementations ship with the crate:
//!
//! * [`AzureOpenAiBackend`] — Azure OpenAI chat completions over `reqwest`,
//!   configured from [`crate::config::InferenceSettings`].
//! * [`LlmProviderBackend`] — any `edgequake_llm` provider (OpenAI,
//!   Anthropic, Gemini, Ollama, …).
//!
//! Backends make exactly one call per request and never retry; retry policy
//! belongs to the orchestrator.

use crate::config::InferenceSettings;
use crate::error::StatementError;
use crate::pipeline::encode::EncodedImage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A single chat-style completion request: one system instruction plus one
/// image as the only user content.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub system_prompt: String,
    pub image: EncodedImage,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Failure reported by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend authentication failed ({0})")]
    Auth(StatusCode),
    #[error("backend returned HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("backend returned no choices")]
    NoChoices,
    #[error("backend returned an empty message")]
    EmptyMessage,
    #[error("unexpected backend response: {0}")]
    InvalidResponse(String),
}

/// Something that can answer an [`ExtractionRequest`].
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Short name for logs, e.g. `"azure-openai"`.
    fn name(&self) -> &str;

    async fn complete(&self, request: &ExtractionRequest) -> Result<String, BackendError>;
}

// ── Azure OpenAI ─────────────────────────────────────────────────────────

/// Azure OpenAI chat-completions client.
#[derive(Debug, Clone)]
pub struct AzureOpenAiBackend {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: Vec<RequestMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum RequestMessage<'a> {
    System { content: &'a str },
    User { content: Vec<ContentPart> },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl AzureOpenAiBackend {
    /// Build a client from complete inference settings.
    pub fn new(settings: &InferenceSettings, timeout: Duration) -> Result<Self, StatementError> {
        let (Some(endpoint), Some(api_key), Some(deployment)) = (
            settings.endpoint.as_deref(),
            settings.api_key.as_deref(),
            settings.deployment.as_deref(),
        ) else {
            return Err(StatementError::InvalidConfig(
                "INFERENCE_ENDPOINT, INFERENCE_KEY and INFERENCE_DEPLOYMENT must all be set"
                    .into(),
            ));
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StatementError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: completions_url(endpoint, deployment, &settings.api_version),
            api_key: api_key.to_string(),
        })
    }
}

/// `{endpoint}/openai/deployments/{deployment}/chat/completions?api-version=…`
pub fn completions_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint.trim_end_matches('/'),
        deployment,
        api_version
    )
}

/// Pull the first choice's text out of a chat-completions body.
fn first_choice_text(body: ChatResponse) -> Result<String, BackendError> {
    let choice = body.choices.into_iter().next().ok_or(BackendError::NoChoices)?;
    let content = choice
        .message
        .and_then(|m| m.content)
        .ok_or(BackendError::EmptyMessage)?;
    if content.trim().is_empty() {
        return Err(BackendError::EmptyMessage);
    }
    Ok(content)
}

#[async_trait]
impl ExtractionBackend for AzureOpenAiBackend {
    fn name(&self) -> &str {
        "azure-openai"
    }

    async fn complete(&self, request: &ExtractionRequest) -> Result<String, BackendError> {
        let payload = ChatRequest {
            messages: vec![
                RequestMessage::System {
                    content: &request.system_prompt,
                },
                RequestMessage::User {
                    content: vec![ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: request.image.data_uri(),
                        },
                    }],
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .http
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        match response.status() {
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(BackendError::Auth(status))
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(BackendError::Http { status, body });
            }
            _ => {}
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let text = first_choice_text(body)?;
        debug!("Received {} chars from {}", text.len(), self.name());
        Ok(text)
    }
}

// ── edgequake-llm providers ──────────────────────────────────────────────

/// Adapter exposing an `edgequake_llm` provider as an [`ExtractionBackend`].
pub struct LlmProviderBackend {
    provider: Arc<dyn LLMProvider>,
    name: String,
}

impl LlmProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }

    /// Instantiate a named provider (`"openai"`, `"anthropic"`, …) with a model.
    ///
    /// The provider factory reads the provider's own API-key variable; call
    /// this once at process start.
    pub fn from_factory(provider_name: &str, model: &str) -> Result<Self, StatementError> {
        let provider = edgequake_llm::ProviderFactory::create_llm_provider(provider_name, model)
            .map_err(|e| {
                StatementError::InvalidConfig(format!(
                    "LLM provider '{provider_name}' is not configured: {e}"
                ))
            })?;
        Ok(Self::new(provider, provider_name))
    }
}

#[async_trait]
impl ExtractionBackend for LlmProviderBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ExtractionRequest) -> Result<String, BackendError> {
        let image = ImageData::new(request.image.base64.clone(), request.image.mime_type.as_str())
            .with_detail("high");
        let messages = vec![
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user_with_images("", vec![image]),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.name, response.prompt_tokens, response.completion_tokens
        );

        if response.content.trim().is_empty() {
            return Err(BackendError::EmptyMessage);
        }
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExtractionRequest {
        ExtractionRequest {
            system_prompt: "extract".into(),
            image: EncodedImage {
                base64: "AAAA".into(),
                mime_type: "image/jpeg".into(),
            },
            temperature: 0.0,
            max_tokens: 2048,
        }
    }

    #[test]
    fn completions_url_layout() {
        assert_eq!(
            completions_url("https://res.openai.azure.com/", "gpt-4o", "2024-06-01"),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn request_body_has_system_and_single_image() {
        let req = request();
        let payload = ChatRequest {
            messages: vec![
                RequestMessage::System {
                    content: &req.system_prompt,
                },
                RequestMessage::User {
                    content: vec![ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: req.image.data_uri(),
                        },
                    }],
                },
            ],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "extract");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"][0]["type"], "image_url");
        assert_eq!(
            json["messages"][1]["content"][0]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
        assert_eq!(json["max_tokens"], 2048);
        assert_eq!(json["temperature"], 0.0);
    }

    #[test]
    fn first_choice_text_extracts_content() {
        let body: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"01.03.2024|X|1"}}]}"#,
        )
        .unwrap();
        assert_eq!(first_choice_text(body).unwrap(), "01.03.2024|X|1");
    }

    #[test]
    fn first_choice_text_rejects_missing_choices() {
        let body: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(first_choice_text(body), Err(BackendError::NoChoices)));

        let body: ChatResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(matches!(first_choice_text(body), Err(BackendError::NoChoices)));
    }

    #[test]
    fn first_choice_text_rejects_empty_message() {
        let body: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(matches!(first_choice_text(body), Err(BackendError::EmptyMessage)));

        let body: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  \n"}}]}"#).unwrap();
        assert!(matches!(first_choice_text(body), Err(BackendError::EmptyMessage)));
    }

    #[test]
    fn azure_backend_requires_complete_settings() {
        let settings = InferenceSettings {
            endpoint: Some("https://res.openai.azure.com".into()),
            api_key: None,
            deployment: Some("gpt-4o".into()),
            api_version: "2024-06-01".into(),
        };
        let err = AzureOpenAiBackend::new(&settings, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, StatementError::InvalidConfig(_)));
    }
}
