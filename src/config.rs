//! Configuration types for diagram extraction sessions.
//!
//! All orchestration behaviour is controlled through [`ExtractionConfig`],
//! built via its [`ExtractionConfigBuilder`]. One struct for every knob keeps
//! configs cheap to share across the spawned session tasks and easy to print
//! when a run misbehaves.

use crate::error::DiagramError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// MIME type accepted by default.
pub const PDF_MIME: &str = "application/pdf";

/// Default per-file size ceiling: 50 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Configuration for a diagram extraction session.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_diagrams::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .batch_size(2)
///     .concurrency(2)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 2);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Files dispatched together before the next batch starts. Default: 3.
    ///
    /// A cancelled session stops at the next batch boundary, so smaller
    /// batches make cancellation more responsive.
    pub batch_size: usize,

    /// Files processed concurrently inside a batch. Default: 3.
    ///
    /// Effective parallelism is `min(batch_size, concurrency)`. Lower it if
    /// the detection API answers with `429`.
    pub concurrency: usize,

    /// Retry attempts for a transient collaborator failure. Default: 3.
    ///
    /// Failures the recovery layer classifies as non-recoverable (bad API
    /// key, unsupported file) are not retried.
    pub max_retries: u32,

    /// Delay schedule between retries. Default: fixed 1 s.
    pub retry_policy: RetryPolicy,

    /// Largest accepted input in bytes. Default: 50 MiB.
    pub max_file_size: u64,

    /// MIME types admitted for processing. Default: `["application/pdf"]`.
    pub supported_mime_types: Vec<String>,

    /// Persist coordinate metadata and page images to the store. Default: true.
    ///
    /// Has no effect when the orchestrator has no store attached.
    pub persist_results: bool,

    /// Accept overlapping diagrams on one page without a warning. Default: true.
    pub allow_overlap: bool,

    /// Maximum rendered page dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for detection calls. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Custom detection system prompt. If None, uses the built-in prompt.
    pub system_prompt: Option<String>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Per-detection-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Age after which finished sessions are dropped by
    /// [`crate::session::Orchestrator::cleanup_sessions`]. Default: 24.
    pub session_max_age_hours: f64,

    /// Session progress callback. Receives the live session on every update.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            concurrency: 3,
            max_retries: 3,
            retry_policy: RetryPolicy::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            supported_mime_types: vec![PDF_MIME.to_string()],
            persist_results: true,
            allow_overlap: true,
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            system_prompt: None,
            password: None,
            api_timeout_secs: 60,
            download_timeout_secs: 120,
            session_max_age_hours: 24.0,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_policy", &self.retry_policy)
            .field("max_file_size", &self.max_file_size)
            .field("supported_mime_types", &self.supported_mime_types)
            .field("persist_results", &self.persist_results)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// True when `mime` is one of the admitted types (case-insensitive).
    pub fn accepts_mime(&self, mime: &str) -> bool {
        self.supported_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime.trim()))
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Shorthand for a fixed retry delay.
    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_policy = RetryPolicy::Fixed { delay_ms: ms };
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.max_file_size = bytes;
        self
    }

    pub fn supported_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.supported_mime_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn persist_results(mut self, v: bool) -> Self {
        self.config.persist_results = v;
        self
    }

    pub fn allow_overlap(mut self, v: bool) -> Self {
        self.config.allow_overlap = v;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn session_max_age_hours(mut self, hours: f64) -> Self {
        self.config.session_max_age_hours = hours;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, DiagramError> {
        let c = &self.config;
        if c.batch_size == 0 {
            return Err(DiagramError::InvalidConfig(
                "Batch size must be ≥ 1".into(),
            ));
        }
        if c.concurrency == 0 {
            return Err(DiagramError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_file_size == 0 {
            return Err(DiagramError::InvalidConfig(
                "Maximum file size must be positive".into(),
            ));
        }
        if c.supported_mime_types.is_empty() {
            return Err(DiagramError::InvalidConfig(
                "At least one supported MIME type is required".into(),
            ));
        }
        if !c.session_max_age_hours.is_finite() || c.session_max_age_hours < 0.0 {
            return Err(DiagramError::InvalidConfig(format!(
                "Session max age must be a non-negative number of hours, got {}",
                c.session_max_age_hours
            )));
        }
        Ok(self.config)
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────

/// Delay schedule applied between retry attempts.
///
/// Defaults to a fixed 1 s wait; `Exponential` is opt-in.
/// `attempt` counts retries from 1, so the first retry waits
/// `delay_for(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RetryPolicy {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base_ms × 2^(attempt-1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed { delay_ms: 1000 }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RetryPolicy::Exponential { base_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(20);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.batch_size, 3);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.max_file_size, 50 * 1024 * 1024);
        assert!(c.accepts_mime("application/pdf"));
        assert!(c.accepts_mime("Application/PDF"));
        assert!(!c.accepts_mime("text/plain"));
    }

    #[test]
    fn builder_clamps() {
        let c = ExtractionConfig::builder()
            .batch_size(0)
            .concurrency(0)
            .temperature(5.0)
            .build()
            .unwrap();
        assert_eq!(c.batch_size, 1);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn builder_rejects_empty_mime_list() {
        let err = ExtractionConfig::builder()
            .supported_mime_types(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, DiagramError::InvalidConfig(_)));
    }

    #[test]
    fn default_retry_policy_is_fixed() {
        let config = ExtractionConfig::builder().build().unwrap();
        assert_eq!(config.retry_policy, RetryPolicy::Fixed { delay_ms: 1000 });
    }

    #[test]
    fn fixed_delay_is_constant() {
        let p = RetryPolicy::Fixed { delay_ms: 250 };
        assert_eq!(p.delay_for(1), Duration::from_millis(250));
        assert_eq!(p.delay_for(4), Duration::from_millis(250));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let p = RetryPolicy::Exponential {
            base_ms: 100,
            max_ms: 350,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(60), Duration::from_millis(350));
    }
}
