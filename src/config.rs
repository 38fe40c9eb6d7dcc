//! Configuration for the statement-processing pipeline.
//!
//! [`PipelineConfig`] is constructed once at process start, from the
//! environment via [`PipelineConfig::from_env`] or explicitly through
//! [`PipelineConfigBuilder`], and then shared read-only (behind an `Arc`)
//! by every component. Nothing below the binary reads process state.

use crate::error::StatementError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Environment variable names recognised by [`PipelineConfig::from_lookup`].
pub mod env {
    pub const DEBUG: &str = "DEBUG";
    pub const INFERENCE_ENDPOINT: &str = "INFERENCE_ENDPOINT";
    pub const INFERENCE_KEY: &str = "INFERENCE_KEY";
    pub const INFERENCE_DEPLOYMENT: &str = "INFERENCE_DEPLOYMENT";
    pub const INFERENCE_API_VERSION: &str = "INFERENCE_API_VERSION";
    pub const TRANSPORT_TOKEN: &str = "TRANSPORT_TOKEN";
    pub const STAGING_ROOT: &str = "STAGING_ROOT";
    pub const PDFIUM_LIB_PATH: &str = "PDFIUM_LIB_PATH";
}

/// Default Azure OpenAI REST API version used for chat completions.
pub const DEFAULT_API_VERSION: &str = "2024-06-01";

/// Connection settings for the Azure OpenAI inference backend.
#[derive(Clone, Default, PartialEq)]
pub struct InferenceSettings {
    /// Base address, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: Option<String>,
    /// `api-key` credential. Never printed by `Debug`.
    pub api_key: Option<String>,
    /// Deployment (model) identifier.
    pub deployment: Option<String>,
    pub api_version: String,
}

impl InferenceSettings {
    /// True when endpoint, key and deployment are all present.
    pub fn is_complete(&self) -> bool {
        [&self.endpoint, &self.api_key, &self.deployment]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

impl fmt::Debug for InferenceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("deployment", &self.deployment)
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// Configuration for one process serving statement documents.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Diagnostic mode: verbose logging and staging directories are kept
    /// after each run for manual inspection. Default: false.
    pub debug: bool,

    /// Directory under which every document gets its own staging directory.
    pub staging_root: PathBuf,

    pub inference: InferenceSettings,

    /// Credential for the inbound chat transport. Never printed by `Debug`.
    pub transport_token: Option<String>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// Extraction must be deterministic: the same page should always yield
    /// the same lines.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 2048.
    pub max_tokens: usize,

    /// Longest edge of a rendered page in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// File format of staged page images. Default: JPEG.
    pub image_format: PageImageFormat,

    /// JPEG quality 1–100. Default: 75.
    pub jpeg_quality: u8,

    /// Number of page extractions in flight for one document. Default: 1.
    ///
    /// 1 keeps the pipeline strictly sequential; higher values issue page
    /// calls concurrently and reassemble results in page order.
    pub concurrency: usize,

    /// What happens when a single page fails. Default: [`PagePolicy::Strict`].
    pub page_policy: PagePolicy,

    /// Retries per page on a failed extraction call. Default: 0.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per extraction call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Explicit pdfium shared library. When `None` the rasterizer tries
    /// `./` and then the system library.
    pub pdfium_lib_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debug: false,
            staging_root: default_staging_root(false),
            inference: InferenceSettings {
                api_version: DEFAULT_API_VERSION.to_string(),
                ..Default::default()
            },
            transport_token: None,
            temperature: 0.0,
            max_tokens: 2048,
            max_rendered_pixels: 2000,
            image_format: PageImageFormat::default(),
            jpeg_quality: 75,
            concurrency: 1,
            page_policy: PagePolicy::default(),
            max_retries: 0,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            pdfium_lib_path: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("debug", &self.debug)
            .field("staging_root", &self.staging_root)
            .field("inference", &self.inference)
            .field(
                "transport_token",
                &self.transport_token.as_ref().map(|_| "<redacted>"),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("image_format", &self.image_format)
            .field("concurrency", &self.concurrency)
            .field("page_policy", &self.page_policy)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

/// `./tmp` in diagnostic mode so retained runs are easy to find, otherwise
/// a `bank_statements` directory under the system temp dir.
fn default_staging_root(debug: bool) -> PathBuf {
    if debug {
        PathBuf::from("tmp")
    } else {
        std::env::temp_dir().join("bank_statements")
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
            staging_root_set: false,
        }
    }

    /// Reopen a built config for further overrides (e.g. CLI flags on top
    /// of the environment). The staging root is kept as is.
    pub fn into_builder(self) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: self,
            staging_root_set: true,
        }
    }

    /// Read the recognised environment variables of the current process.
    pub fn from_env() -> Result<Self, StatementError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    ///
    /// Empty values count as unset. Unrecognised keys are ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StatementError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut builder = Self::builder()
            .debug(get(env::DEBUG).as_deref().is_some_and(parse_flag));

        if let Some(endpoint) = get(env::INFERENCE_ENDPOINT) {
            builder = builder.inference_endpoint(endpoint);
        }
        if let Some(key) = get(env::INFERENCE_KEY) {
            builder = builder.inference_key(key);
        }
        if let Some(deployment) = get(env::INFERENCE_DEPLOYMENT) {
            builder = builder.inference_deployment(deployment);
        }
        if let Some(version) = get(env::INFERENCE_API_VERSION) {
            builder = builder.inference_api_version(version);
        }
        if let Some(token) = get(env::TRANSPORT_TOKEN) {
            builder = builder.transport_token(token);
        }
        if let Some(root) = get(env::STAGING_ROOT) {
            builder = builder.staging_root(root);
        }
        if let Some(lib) = get(env::PDFIUM_LIB_PATH) {
            builder = builder.pdfium_lib_path(lib);
        }

        builder.build()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    staging_root_set: bool,
}

impl PipelineConfigBuilder {
    pub fn debug(mut self, v: bool) -> Self {
        self.config.debug = v;
        self
    }

    pub fn staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.staging_root = root.into();
        self.staging_root_set = true;
        self
    }

    pub fn inference_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.inference.endpoint = Some(endpoint.into());
        self
    }

    pub fn inference_key(mut self, key: impl Into<String>) -> Self {
        self.config.inference.api_key = Some(key.into());
        self
    }

    pub fn inference_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.config.inference.deployment = Some(deployment.into());
        self
    }

    pub fn inference_api_version(mut self, version: impl Into<String>) -> Self {
        self.config.inference.api_version = version.into();
        self
    }

    pub fn transport_token(mut self, token: impl Into<String>) -> Self {
        self.config.transport_token = Some(token.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn image_format(mut self, format: PageImageFormat) -> Self {
        self.config.image_format = format;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn page_policy(mut self, policy: PagePolicy) -> Self {
        self.config.page_policy = policy;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<PipelineConfig, StatementError> {
        if !self.staging_root_set {
            self.config.staging_root = default_staging_root(self.config.debug);
        }

        let c = &self.config;
        if c.concurrency == 0 {
            return Err(StatementError::InvalidConfig(
                "concurrency must be ≥ 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&c.temperature) {
            return Err(StatementError::InvalidConfig(format!(
                "temperature must be 0.0–2.0, got {}",
                c.temperature
            )));
        }
        if c.jpeg_quality == 0 || c.jpeg_quality > 100 {
            return Err(StatementError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.jpeg_quality
            )));
        }
        if c.max_tokens == 0 {
            return Err(StatementError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(StatementError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Encoding of staged page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageImageFormat {
    /// Compact, the format the extraction prompt was tuned with. (default)
    #[default]
    Jpeg,
    /// Lossless; larger uploads but crisper small print.
    Png,
}

impl PageImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PageImageFormat::Jpeg => "jpg",
            PageImageFormat::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            PageImageFormat::Jpeg => "image/jpeg",
            PageImageFormat::Png => "image/png",
        }
    }

    /// Infer the format of a staged image from its extension.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(PageImageFormat::Jpeg),
            "png" => Some(PageImageFormat::Png),
            _ => None,
        }
    }
}

/// How a single failing page affects the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PagePolicy {
    /// Any page failure fails the document; no partial report. (default)
    #[default]
    Strict,
    /// Failed pages are omitted; the report lists them and the requester is
    /// told which pages are missing. Fails only if every page fails.
    SkipFailed,
}
