//! Error types for the edgequake-diagrams library.
//!
//! Two tiers mirror the two ways a run can go wrong:
//!
//! * [`DiagramError`] — **Fatal**: the request cannot proceed at all (bad
//!   configuration, unknown session, provider not configured). Returned as
//!   `Err(DiagramError)` from the public entry points.
//!
//! * [`FileError`] — **Non-fatal**: one input file failed (rejected at
//!   admission, extraction broke, detection exhausted its retries) while its
//!   siblings carry on. Stored on the file's entry in the
//!   [`crate::session::ProcessingSession`].
//!
//! Collaborator failures ([`ExtractError`], [`DetectError`], [`StoreError`])
//! know their error code and HTTP status so the recovery layer can classify
//! them without string matching where possible. Geometry problems are never
//! errors: validation returns them as data.

use crate::recovery::ErrorInfo;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-diagrams library.
#[derive(Debug, Error)]
pub enum DiagramError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Session errors ────────────────────────────────────────────────────
    /// No session with this id is tracked (never started or cleaned up).
    #[error("Unknown processing session '{id}'")]
    SessionNotFound { id: String },

    // ── Detection errors ──────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Component errors ──────────────────────────────────────────────────
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single input file.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FileError {
    /// The file failed admission (type, size or content check).
    #[error("{name}: {reason}")]
    Rejected { name: String, reason: String },

    /// Page/text extraction failed after retries.
    #[error("{name}: page extraction failed: {detail}")]
    ExtractionFailed { name: String, detail: String },

    /// Diagram detection failed after retries and fallbacks.
    #[error("{name}: diagram detection failed on page {page} after {retries} retries: {detail}")]
    DetectionFailed {
        name: String,
        page: usize,
        retries: u32,
        detail: String,
    },

    /// Results could not be persisted.
    #[error("{name}: failed to store results: {detail}")]
    StoreFailed { name: String, detail: String },

    /// Memory for the file could not be reserved.
    #[error("{name}: {detail}")]
    MemoryExhausted { name: String, detail: String },

    /// Processing stopped because the session was cancelled.
    #[error("{name}: cancelled")]
    Cancelled { name: String },
}

impl FileError {
    /// Name of the file this error belongs to.
    pub fn file_name(&self) -> &str {
        match self {
            FileError::Rejected { name, .. }
            | FileError::ExtractionFailed { name, .. }
            | FileError::DetectionFailed { name, .. }
            | FileError::StoreFailed { name, .. }
            | FileError::MemoryExhausted { name, .. }
            | FileError::Cancelled { name } => name,
        }
    }
}

/// Failure reported by a [`crate::pipeline::extract::PageExtractor`].
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The bytes are not a PDF.
    #[error("not a PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {0}")]
    Corrupt(String),

    /// PDF requires a password but none (or a wrong one) was provided.
    #[error("PDF is encrypted and requires a password")]
    PasswordRequired,

    /// Rasterising a page failed.
    #[error("rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The PDF engine could not be loaded.
    #[error("PDF engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("extraction task failed: {0}")]
    Task(String),
}

impl ExtractError {
    /// Error code understood by [`crate::recovery::classify_error`].
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::NotAPdf { .. } => "UNSUPPORTED_FORMAT",
            ExtractError::Corrupt(_) => "CORRUPTED_FILE",
            ExtractError::PasswordRequired => "PERMISSION_DENIED",
            ExtractError::RasterisationFailed { .. } => "PDF_PARSE_ERROR",
            ExtractError::EngineUnavailable(_) => "EXTRACTION_FAILED",
            ExtractError::Task(_) => "EXTRACTION_FAILED",
        }
    }

    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

/// Failure reported by a [`crate::pipeline::detect::DiagramDetector`].
#[derive(Debug, Clone, Error)]
pub enum DetectError {
    /// HTTP 429 — caller should back off.
    #[error("rate limit exceeded (HTTP 429)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// HTTP 401/403 — retrying will not help.
    #[error("authentication failed (HTTP {status}): {detail}")]
    Unauthorized { status: u16, detail: String },

    /// The call exceeded its timeout.
    #[error("detection call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Any other HTTP status from the API.
    #[error("detection API returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Image encoding or request construction failed locally.
    #[error("could not prepare page image: {0}")]
    Encode(String),

    /// Provider error without a recognisable status.
    #[error("detection failed: {0}")]
    Provider(String),
}

impl DetectError {
    /// HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            DetectError::RateLimited { .. } => Some(429),
            DetectError::Unauthorized { status, .. } | DetectError::Http { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Error code understood by [`crate::recovery::classify_error`].
    pub fn code(&self) -> &'static str {
        match self {
            DetectError::RateLimited { .. } => "RATE_LIMITED",
            DetectError::Unauthorized { status: 403, .. } => "FORBIDDEN",
            DetectError::Unauthorized { .. } => "UNAUTHORIZED",
            DetectError::Timeout { .. } => "TIMEOUT",
            DetectError::Http { status, .. } if *status >= 500 => "SERVER_ERROR",
            DetectError::Http { .. } => "AI_PROCESSING_FAILED",
            DetectError::Network(_) => "CONNECTION_FAILED",
            DetectError::Encode(_) => "AI_PROCESSING_FAILED",
            DetectError::Provider(_) => "AI_PROCESSING_FAILED",
        }
    }

    pub fn error_info(&self) -> ErrorInfo {
        let mut info = ErrorInfo::new(self.code(), self.to_string());
        info.status = self.status();
        info
    }
}

/// Failure reported by a [`crate::pipeline::store::CoordinateStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record '{0}' not found")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("could not serialise record: {0}")]
    Serialization(String),
}

/// Failure of [`crate::render::DiagramRenderer`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Invalid coordinates: negative values are not allowed ({x1}, {y1})")]
    NegativeCoordinates { x1: f64, y1: f64 },

    #[error("Invalid coordinates: box ({x2}, {y2}) exceeds image bounds {width}x{height}")]
    OutOfBounds {
        x2: f64,
        y2: f64,
        width: u32,
        height: u32,
    },

    #[error("Invalid coordinates: x2/y2 must be greater than x1/y1")]
    InvalidOrdering,

    #[error("Invalid coordinates: values must be finite")]
    NonFinite,

    #[error("Padding of {padding}px does not fit the output size")]
    PaddingTooLarge { padding: u32 },

    #[error("Failed to encode rendered diagram: {0}")]
    Encode(String),

    #[error("Not enough memory to render diagram: {0}")]
    OutOfMemory(String),
}

/// Failure of [`crate::memory::MemoryManager`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MemoryError {
    /// Allocation would push usage past the hard ceiling.
    #[error(
        "Memory limit exceeded: requested {requested} bytes with {used}/{limit} bytes in use"
    )]
    LimitExceeded { requested: u64, used: u64, limit: u64 },

    #[error("Memory pool '{0}' already exists")]
    PoolExists(String),

    #[error("Chunk {index} failed: {detail}")]
    ChunkFailed { index: usize, detail: String },
}
