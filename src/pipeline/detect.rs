//! Diagram detection: send a page image to a vision model and get raw JSON
//! text back.
//!
//! This module is intentionally thin. Prompts live in [`crate::prompts`],
//! parsing lives in [`crate::pipeline::parse`], and retries live in the
//! session orchestrator, which classifies each failure before deciding to
//! try again. A detector makes exactly one call per `detect`.
//!
//! ## Message Layout
//!
//! 1. **System message**: the detection prompt (or the configured override)
//! 2. **User message**: the page dimensions as text plus the page PNG
//!
//! The dimensions matter: the model returns pixel coordinates, and without
//! the exact size it tends to answer in a normalised 0..1000 space.

use crate::config::ExtractionConfig;
use crate::error::{DetectError, DiagramError};
use crate::pipeline::extract::PageImage;
use crate::prompts::{page_context, DETECTION_SYSTEM_PROMPT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Raw text returned by a detector, plus token accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionOutput {
    pub raw: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl DetectionOutput {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Default::default()
        }
    }
}

/// Something that can look at a page and describe its questions and
/// diagrams as JSON text.
#[async_trait]
pub trait DiagramDetector: Send + Sync {
    /// Short name used in logs and recovery records.
    fn name(&self) -> &str;

    async fn detect(&self, page: &PageImage) -> Result<DetectionOutput, DetectError>;
}

/// Shared handle to a detector.
pub type SharedDetector = Arc<dyn DiagramDetector>;

/// Detector backed by an `edgequake_llm` vision provider.
pub struct VisionDetector {
    provider: Arc<dyn LLMProvider>,
    name: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
}

impl std::fmt::Debug for VisionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionDetector")
            .field("name", &self.name)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl VisionDetector {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        let name = config
            .provider_name
            .clone()
            .unwrap_or_else(|| "vision".to_string());
        Self {
            provider,
            name,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DETECTION_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Resolve a provider from `config` and the environment, then wrap it.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, DiagramError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DiagramDetector for VisionDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, page: &PageImage) -> Result<DetectionOutput, DetectError> {
        let start = Instant::now();
        let image_data = encode_page(&page.image).map_err(|e| DetectError::Encode(e.to_string()))?;

        let context = page_context(
            page.page_number,
            page.dimensions.width,
            page.dimensions.height,
        );
        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user_with_images(&context, vec![image_data]),
        ];
        let options = self.options();

        let response = tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| DetectError::Timeout {
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens, {:?}",
            page.page_number,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(DetectionOutput {
            raw: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

/// Encode a rasterised page as a base64 PNG for the vision API.
///
/// PNG keeps printed labels crisp; `detail: "high"` lets the model see
/// fine print inside figures.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

static STATUS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:status(?:\s+code)?|http)[\s:=]*([1-5]\d\d)\b").expect("valid regex")
});

/// Map a provider error message onto a [`DetectError`].
///
/// Providers surface HTTP failures as text; an explicit status wins over
/// keywords.
pub fn classify_provider_error(message: &str) -> DetectError {
    let lower = message.to_lowercase();
    let status = STATUS_RE
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok());

    match status {
        Some(429) => DetectError::RateLimited {
            retry_after_secs: None,
        },
        Some(s @ (401 | 403)) => DetectError::Unauthorized {
            status: s,
            detail: message.to_string(),
        },
        Some(408 | 504) => DetectError::Timeout { secs: 0 },
        Some(s) => DetectError::Http {
            status: s,
            detail: message.to_string(),
        },
        None if lower.contains("rate limit") || lower.contains("too many requests") => {
            DetectError::RateLimited {
                retry_after_secs: None,
            }
        }
        None if lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("authentication") =>
        {
            DetectError::Unauthorized {
                status: 401,
                detail: message.to_string(),
            }
        }
        None if lower.contains("timed out") || lower.contains("timeout") => {
            DetectError::Timeout { secs: 0 }
        }
        None if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("dns") =>
        {
            DetectError::Network(message.to_string())
        }
        None => DetectError::Provider(message.to_string()),
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, DiagramError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        DiagramError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Auto-detection** via [`ProviderFactory::from_env`].
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, DiagramError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| DiagramError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
