//! Diagram geometry: the box model and everything that checks, repairs or
//! edits it.
//!
//! ```text
//! detector JSON ──▶ validate ──▶ sanitize ──▶ store
//!                                  ▲
//!                    editor ───────┘  (drag / resize / numeric input)
//! ```
//!
//! 1. [`types`]    — `DiagramCoordinates`, `ImageDimensions`, `CoordinateMetadata`
//! 2. [`validate`] — pure rule checks returning every violation as data
//! 3. [`sanitize`] — deterministic repair under named profiles
//! 4. [`editor`]   — pointer-driven editing in a zoomed/panned canvas

pub mod editor;
pub mod sanitize;
pub mod types;
pub mod validate;

pub use editor::{CoordinateEditor, CoordinateField, DragHandle, EditorConfig, EditorState, ViewTransform};
pub use sanitize::{
    batch_sanitize, sanitize, sanitize_for_api_response, sanitize_for_manual_edit,
    sanitize_for_storage, ConfidenceAdjustment, SanitizeChange, SanitizeOptions, SanitizeResult,
    Size,
};
pub use types::{
    CoordinateMetadata, DiagramCoordinates, DiagramRecord, DiagramType, ImageDimensions,
    ModifiedBy, Point,
};
pub use validate::{validate, validate_array, validate_with, ArrayValidationResult, ValidationResult, ValidationRules};
