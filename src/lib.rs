//! # edgequake-diagrams
//!
//! Find, validate and render diagrams in scanned question-paper PDFs using
//! Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Exam papers mix printed questions with graphs, circuits and geometry
//! figures. A text extractor sees none of the figures. This crate rasterises
//! each page, asks a VLM where the questions and diagrams are, and treats
//! every returned box as untrusted input: it is validated against the page,
//! repaired where possible, and only then stored or rendered.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF files
//!  │
//!  ├─ 1. Admit    name / MIME / size checks per file
//!  ├─ 2. Extract  rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Detect   one VLM call per page → raw JSON
//!  ├─ 4. Parse    lenient JSON, validate + sanitize every box
//!  ├─ 5. Store    coordinates and page images per question
//!  └─ 6. Render   crop, scale and cache diagrams on demand
//! ```
//!
//! Files are processed in batches by the [`Orchestrator`], which classifies
//! every failure through the [`RecoveryManager`] and tracks memory through
//! the [`MemoryManager`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_diagrams::{load_input, ExtractionConfig, Orchestrator, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let orchestrator = Orchestrator::from_config(config)?;
//!
//!     let file = load_input("paper.pdf", 60).await?;
//!     let id = orchestrator.start_processing_session(vec![file], SessionOptions::default());
//!     orchestrator.wait_for_session(&id).await?;
//!
//!     if let Some(results) = orchestrator.get_orchestration_results(&id) {
//!         println!("{} questions, {} diagrams", results.total_questions, results.total_diagrams);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2diagrams` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-diagrams = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod geometry;
pub mod memory;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod recovery;
pub mod render;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, RetryPolicy};
pub use error::{
    DetectError, DiagramError, ExtractError, FileError, MemoryError, RenderError, StoreError,
};
pub use geometry::{
    sanitize_for_api_response, sanitize_for_manual_edit, sanitize_for_storage, validate,
    validate_array, CoordinateEditor, CoordinateMetadata, DiagramCoordinates, DiagramType,
    ImageDimensions, ModifiedBy, SanitizeResult, ValidationResult,
};
pub use memory::{MemoryConfig, MemoryManager, MemoryStats, PressureLevel};
pub use pipeline::{
    load_input, CoordinateStore, DiagramDetector, InMemoryStore, InputFile, PageExtractor,
    PageImage, PdfiumPageExtractor, VisionDetector,
};
pub use progress::{NoopProgressCallback, ProgressCallback, SessionProgressCallback};
pub use recovery::{
    classify_error, ErrorCategory, ErrorClassification, ErrorInfo, RecoveryConfig,
    RecoveryContext, RecoveryManager, RecoveryOutcome,
};
pub use render::{DiagramRenderer, RenderOptions, RenderedDiagram, SourceImage};
pub use session::{
    CancellationToken, FileEntry, FileResult, FileStatus, OrchestrationResults, Orchestrator,
    ProcessingSession, SessionOptions, SessionStatus,
};
