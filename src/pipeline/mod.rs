//! Pipeline stages for diagram extraction.
//!
//! Each submodule implements exactly one step. The session orchestrator
//! drives them per file and owns retries, recovery and progress.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ detect ──▶ parse ──▶ store
//! (admit)   (pdfium)    (VLM)     (validate   (coordinates,
//!                                  + sanitize)  page images)
//! ```
//!
//! 1. [`input`]   — file name/MIME/size admission and path or URL loading
//! 2. [`extract`] — rasterise pages and read the text layer; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`detect`]  — one vision-model call per page returning raw JSON text
//! 4. [`parse`]   — lenient JSON reading, then validation and repair of every
//!    box against the page it came from
//! 5. [`store`]   — persistence of coordinates, page images and renders

pub mod detect;
pub mod extract;
pub mod input;
pub mod parse;
pub mod store;

pub use detect::{
    classify_provider_error, encode_page, resolve_provider, DetectionOutput, DiagramDetector,
    SharedDetector, VisionDetector,
};
pub use extract::{
    DocumentMetadata, ExtractedDocument, PageExtractor, PageImage, PageInfo, PdfiumPageExtractor,
};
pub use input::{admit_file, is_url, load_input, mime_from_name, InputFile};
pub use parse::{
    process_page_diagrams, DetectionResponse, ExtractedQuestion, PageDiagrams, ProcessedPage,
    RawDiagram, RawQuestion,
};
pub use store::{apply_user_edit, page_image_key, CoordinateStore, InMemoryStore};
