//! Geometry validation: pure checks of a box against an image and the
//! business rules every stored diagram must satisfy.
//!
//! Validation never fails loudly. Each violated rule becomes one message in
//! [`ValidationResult::errors`] so callers can show all problems at once or
//! hand the box to [`crate::geometry::sanitize`] for repair.

use super::types::{DiagramCoordinates, ImageDimensions};
use serde::{Deserialize, Serialize};

/// Default minimum width and height of a diagram box in pixels.
pub const DEFAULT_MIN_SIZE: f64 = 10.0;

/// Outcome of validating a single box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

/// Outcome of validating a set of boxes on the same page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub per_box: Vec<ValidationResult>,
    /// Index pairs `(i, j)` with `i < j` whose boxes intersect.
    pub overlaps: Vec<(usize, usize)>,
}

/// Tunable thresholds for [`validate_with`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationRules {
    pub min_width: f64,
    pub min_height: f64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_width: DEFAULT_MIN_SIZE,
            min_height: DEFAULT_MIN_SIZE,
        }
    }
}

/// Validate a box with the default rules.
pub fn validate(coords: &DiagramCoordinates, dims: &ImageDimensions) -> ValidationResult {
    validate_with(coords, dims, &ValidationRules::default())
}

/// Validate a box against `dims` and `rules`.
///
/// Checks run in a fixed order: finiteness, ordering, bounds, minimum size,
/// confidence range. A non-finite field stops the remaining checks since
/// none of them are meaningful on NaN or infinity.
pub fn validate_with(
    coords: &DiagramCoordinates,
    dims: &ImageDimensions,
    rules: &ValidationRules,
) -> ValidationResult {
    let mut errors = Vec::new();

    if !coords.is_finite() {
        errors.push("All coordinates and confidence must be finite numbers".to_string());
        return ValidationResult::from_errors(errors);
    }

    if coords.x2 <= coords.x1 {
        errors.push(format!(
            "x2 ({}) must be greater than x1 ({})",
            coords.x2, coords.x1
        ));
    }
    if coords.y2 <= coords.y1 {
        errors.push(format!(
            "y2 ({}) must be greater than y1 ({})",
            coords.y2, coords.y1
        ));
    }

    errors.extend(bounds_errors(coords, dims));

    let (w, h) = (coords.width(), coords.height());
    if w > 0.0 && w < rules.min_width {
        errors.push(format!(
            "Width {} is below the minimum of {}px",
            w, rules.min_width
        ));
    }
    if h > 0.0 && h < rules.min_height {
        errors.push(format!(
            "Height {} is below the minimum of {}px",
            h, rules.min_height
        ));
    }

    if !(0.0..=1.0).contains(&coords.confidence) {
        errors.push(format!(
            "Confidence {} must be between 0 and 1",
            coords.confidence
        ));
    }

    ValidationResult::from_errors(errors)
}

fn bounds_errors(coords: &DiagramCoordinates, dims: &ImageDimensions) -> Vec<String> {
    let (w, h) = (dims.width_f(), dims.height_f());
    let mut errors = Vec::new();
    if coords.x1 < 0.0 {
        errors.push(format!("Out of bounds: x1 ({}) is negative", coords.x1));
    }
    if coords.y1 < 0.0 {
        errors.push(format!("Out of bounds: y1 ({}) is negative", coords.y1));
    }
    if coords.x2 > w {
        errors.push(format!(
            "Out of bounds: x2 ({}) exceeds image width ({})",
            coords.x2, dims.width
        ));
    }
    if coords.y2 > h {
        errors.push(format!(
            "Out of bounds: y2 ({}) exceeds image height ({})",
            coords.y2, dims.height
        ));
    }
    errors
}

/// True when the box lies entirely inside `[0,width]×[0,height]`.
pub fn is_within_bounds(coords: &DiagramCoordinates, dims: &ImageDimensions) -> bool {
    coords.is_finite() && bounds_errors(coords, dims).is_empty()
}

/// Validate page dimensions received from an extraction collaborator.
pub fn validate_dimensions(width: u32, height: u32) -> ValidationResult {
    let mut errors = Vec::new();
    if width == 0 {
        errors.push("Image width must be positive".to_string());
    }
    if height == 0 {
        errors.push("Image height must be positive".to_string());
    }
    ValidationResult::from_errors(errors)
}

/// Validate every box, then check pairwise overlap.
///
/// Overlapping pairs are always reported in `overlaps`; they only make the
/// result invalid when `allow_overlap` is false.
pub fn validate_array(
    boxes: &[DiagramCoordinates],
    dims: &ImageDimensions,
    allow_overlap: bool,
) -> ArrayValidationResult {
    let per_box: Vec<ValidationResult> = boxes.iter().map(|b| validate(b, dims)).collect();

    let mut errors: Vec<String> = per_box
        .iter()
        .enumerate()
        .flat_map(|(i, r)| r.errors.iter().map(move |e| format!("Diagram {}: {}", i, e)))
        .collect();

    let mut overlaps = Vec::new();
    for i in 0..boxes.len() {
        for j in (i + 1)..boxes.len() {
            if boxes[i].overlaps(&boxes[j]) {
                overlaps.push((i, j));
            }
        }
    }

    if !allow_overlap {
        errors.extend(
            overlaps
                .iter()
                .map(|(i, j)| format!("Diagrams {} and {} overlap", i, j)),
        );
    }

    ArrayValidationResult {
        is_valid: errors.is_empty(),
        errors,
        per_box,
        overlaps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> ImageDimensions {
        ImageDimensions::new(800, 600).unwrap()
    }

    #[test]
    fn valid_box_passes() {
        let c = DiagramCoordinates::new(100.0, 150.0, 300.0, 250.0).with_confidence(0.9);
        let r = validate(&c, &dims());
        assert!(r.is_valid, "errors: {:?}", r.errors);
    }

    #[test]
    fn out_of_bounds_reports_each_edge() {
        let c = DiagramCoordinates::new(-10.0, -5.0, 900.0, 700.0);
        let r = validate(&c, &dims());
        assert!(!r.is_valid);
        let oob = r
            .errors
            .iter()
            .filter(|e| e.to_lowercase().contains("out of bounds"))
            .count();
        assert_eq!(oob, 4, "errors: {:?}", r.errors);
    }

    #[test]
    fn misordered_box_fails() {
        let c = DiagramCoordinates::new(300.0, 250.0, 100.0, 150.0);
        let r = validate(&c, &dims());
        assert!(r.errors.iter().any(|e| e.contains("x2")));
        assert!(r.errors.iter().any(|e| e.contains("y2")));
    }

    #[test]
    fn non_finite_stops_early() {
        let c = DiagramCoordinates::new(f64::NAN, 0.0, 10.0, 10.0);
        let r = validate(&c, &dims());
        assert_eq!(r.errors.len(), 1);
    }

    #[test]
    fn small_box_and_bad_confidence() {
        let c = DiagramCoordinates::new(10.0, 10.0, 15.0, 40.0).with_confidence(1.5);
        let r = validate(&c, &dims());
        assert_eq!(r.errors.len(), 2, "errors: {:?}", r.errors);
        assert!(r.errors[0].starts_with("Width 5"));
        assert!(r.errors[1].contains("Confidence"));
    }

    #[test]
    fn custom_min_size() {
        let c = DiagramCoordinates::new(10.0, 10.0, 15.0, 15.0);
        let rules = ValidationRules {
            min_width: 2.0,
            min_height: 2.0,
        };
        assert!(validate_with(&c, &dims(), &rules).is_valid);
    }

    #[test]
    fn overlapping_pair_detected() {
        let a = DiagramCoordinates::new(100.0, 150.0, 300.0, 250.0);
        let b = DiagramCoordinates::new(200.0, 200.0, 400.0, 350.0);
        let r = validate_array(&[a.clone(), b.clone()], &dims(), false);
        assert!(!r.is_valid);
        assert_eq!(r.overlaps, vec![(0, 1)]);

        let allowed = validate_array(&[a, b], &dims(), true);
        assert!(allowed.is_valid);
        assert_eq!(allowed.overlaps, vec![(0, 1)]);
    }

    #[test]
    fn disjoint_pair_passes() {
        let a = DiagramCoordinates::new(100.0, 150.0, 200.0, 250.0);
        let b = DiagramCoordinates::new(300.0, 350.0, 400.0, 450.0);
        let r = validate_array(&[a, b], &dims(), false);
        assert!(r.is_valid, "errors: {:?}", r.errors);
        assert!(r.overlaps.is_empty());
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(!validate_dimensions(0, 10).is_valid);
        assert!(validate_dimensions(1, 1).is_valid);
    }
}
