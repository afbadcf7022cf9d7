//! Geometry sanitisation: repair invalid or borderline boxes.
//!
//! [`sanitize`] applies a fixed sequence of repairs so the same input and
//! options always yield the same output:
//!
//! 0. replace non-finite fields and swap mis-ordered corners
//! 1. clamp to the image bounds
//! 2. grow to the minimum size, then shrink to the maximum size
//! 3. restore the original aspect ratio (`preserve_aspect_ratio`)
//! 4. nudge proportions per diagram type (`type_specific_rules`)
//! 5. snap to the pixel grid (`snap_to_grid`)
//! 6. adjust confidence
//!
//! Between steps the box is re-checked against bounds, ordering and the
//! size limits, so no step can hand an invalid box to the next one. When the
//! image is smaller than the configured minimum, the minimum shrinks to the
//! image extent.
//!
//! The three named profiles ([`sanitize_for_manual_edit`],
//! [`sanitize_for_api_response`], [`sanitize_for_storage`]) wrap this core
//! with fixed option sets for their producer or consumer.

use super::types::{DiagramCoordinates, DiagramType, ImageDimensions};
use serde::{Deserialize, Serialize};

/// Width/height pair used for size limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// How confidence is adjusted in the final step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceAdjustment {
    /// Move confidence towards 1.0 (human-confirmed boxes).
    Boost,
    /// Lower confidence in proportion to the repairs that were needed.
    Penalize,
    #[default]
    None,
}

/// Independently toggleable sanitiser options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizeOptions {
    pub min_size: Option<Size>,
    pub max_size: Option<Size>,
    /// Grid step in pixels; `Some(1.0)` rounds to integers.
    pub snap_to_grid: Option<f64>,
    pub preserve_aspect_ratio: bool,
    pub type_specific_rules: bool,
    pub confidence_adjustment: ConfidenceAdjustment,
}

impl SanitizeOptions {
    /// Options for boxes a user just dragged or typed in.
    pub fn manual_edit() -> Self {
        Self {
            min_size: Some(Size::new(MANUAL_EDIT_MIN_SIZE, MANUAL_EDIT_MIN_SIZE)),
            snap_to_grid: Some(MANUAL_EDIT_GRID),
            confidence_adjustment: ConfidenceAdjustment::Boost,
            ..Default::default()
        }
    }

    /// Options for raw detector output on an image of `dims`.
    pub fn api_response(dims: &ImageDimensions) -> Self {
        Self {
            min_size: Some(Size::new(STORAGE_MIN_SIZE, STORAGE_MIN_SIZE)),
            max_size: Some(Size::new(
                dims.width_f() * API_MAX_FRACTION,
                dims.height_f() * API_MAX_FRACTION,
            )),
            preserve_aspect_ratio: true,
            type_specific_rules: true,
            confidence_adjustment: ConfidenceAdjustment::Penalize,
            ..Default::default()
        }
    }

    /// Options for the persisted form: integer coordinates.
    pub fn storage() -> Self {
        Self {
            min_size: Some(Size::new(STORAGE_MIN_SIZE, STORAGE_MIN_SIZE)),
            snap_to_grid: Some(1.0),
            ..Default::default()
        }
    }
}

const MANUAL_EDIT_MIN_SIZE: f64 = 20.0;
const MANUAL_EDIT_GRID: f64 = 5.0;
const STORAGE_MIN_SIZE: f64 = 10.0;
const API_MAX_FRACTION: f64 = 0.8;

const CONFIDENCE_BOOST: f64 = 0.1;
const PENALTY_PER_CHANGE: f64 = 0.05;
const SIGNIFICANT_RESIZE: f64 = 0.1;
const RATIO_TOLERANCE: f64 = 0.01;

const TABLE_MIN_RATIO: f64 = 1.2;
const TABLE_TARGET_RATIO: f64 = 1.25;
const GRAPH_MIN_RATIO: f64 = 0.5;
const GRAPH_MAX_RATIO: f64 = 2.5;
const GEOMETRIC_MIN_RATIO: f64 = 0.8;
const GEOMETRIC_MAX_RATIO: f64 = 1.25;

/// Category of repair recorded in [`SanitizeResult::changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SanitizeChange {
    NonFinite,
    Ordering,
    Bounds,
    Size,
    Aspect,
    Type,
    Grid,
    Confidence,
}

/// Output of [`sanitize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizeResult {
    pub sanitized: DiagramCoordinates,
    pub changes: Vec<SanitizeChange>,
    pub warnings: Vec<String>,
}

impl SanitizeResult {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    width: f64,
    height: f64,
    min_w: f64,
    min_h: f64,
    max_w: f64,
    max_h: f64,
}

impl Limits {
    fn new(dims: &ImageDimensions, opts: &SanitizeOptions) -> Self {
        let (width, height) = (dims.width_f(), dims.height_f());
        // Never below one pixel so x2 > x1 always holds.
        let min_w = opts.min_size.map_or(1.0, |s| s.width).max(1.0).min(width);
        let min_h = opts.min_size.map_or(1.0, |s| s.height).max(1.0).min(height);
        let max_w = opts.max_size.map_or(width, |s| s.width).min(width).max(min_w);
        let max_h = opts.max_size.map_or(height, |s| s.height).min(height).max(min_h);
        Self {
            width,
            height,
            min_w,
            min_h,
            max_w,
            max_h,
        }
    }
}

struct Recorder {
    changes: Vec<SanitizeChange>,
    warnings: Vec<String>,
}

impl Recorder {
    fn change(&mut self, c: SanitizeChange) {
        if !self.changes.contains(&c) {
            self.changes.push(c);
        }
    }

    fn warn(&mut self, w: String) {
        self.warnings.push(w);
    }
}

/// Repair `coords` so it satisfies bounds, ordering and `opts`.
pub fn sanitize(
    coords: &DiagramCoordinates,
    dims: &ImageDimensions,
    opts: &SanitizeOptions,
) -> SanitizeResult {
    let limits = Limits::new(dims, opts);
    let mut c = coords.clone();
    let mut rec = Recorder {
        changes: Vec::new(),
        warnings: Vec::new(),
    };

    // Step 0
    repair_non_finite(&mut c, &limits, &mut rec);
    repair_ordering(&mut c, &mut rec);
    let reference_ratio = c.aspect_ratio();

    // Step 1
    if clamp_to_bounds(&mut c, &limits) {
        rec.change(SanitizeChange::Bounds);
    }

    // Step 2
    enforce_size(&mut c, &limits, &mut rec);
    settle(&mut c, &limits, &mut rec);

    // Step 3
    if opts.preserve_aspect_ratio {
        if let (Some(target), Some(current)) = (reference_ratio, c.aspect_ratio()) {
            if ratio_differs(current, target) {
                fit_ratio(&mut c, target, &limits);
                rec.change(SanitizeChange::Aspect);
            }
        }
        settle(&mut c, &limits, &mut rec);
    }

    // Step 4
    if opts.type_specific_rules {
        apply_type_rules(&mut c, &limits, &mut rec);
        settle(&mut c, &limits, &mut rec);
    }

    // Step 5
    if let Some(step) = opts.snap_to_grid.filter(|s| s.is_finite() && *s > 0.0) {
        if snap(&mut c, step) {
            rec.change(SanitizeChange::Grid);
        }
        settle(&mut c, &limits, &mut rec);
    }

    // Step 6
    adjust_confidence(&mut c, opts.confidence_adjustment, &mut rec);

    SanitizeResult {
        sanitized: c,
        changes: rec.changes,
        warnings: rec.warnings,
    }
}

/// Apply the same options to every box independently.
pub fn batch_sanitize(
    boxes: &[DiagramCoordinates],
    dims: &ImageDimensions,
    opts: &SanitizeOptions,
) -> Vec<SanitizeResult> {
    boxes.iter().map(|b| sanitize(b, dims, opts)).collect()
}

/// Profile for user edits: 5px grid, confidence boost, 20px minimum.
pub fn sanitize_for_manual_edit(
    coords: &DiagramCoordinates,
    dims: &ImageDimensions,
) -> SanitizeResult {
    sanitize(coords, dims, &SanitizeOptions::manual_edit())
}

/// Profile for detector output: aspect ratio, type rules, 80% size cap.
pub fn sanitize_for_api_response(
    coords: &DiagramCoordinates,
    dims: &ImageDimensions,
) -> SanitizeResult {
    sanitize(coords, dims, &SanitizeOptions::api_response(dims))
}

/// Profile for persistence: integer coordinates, 10px minimum.
pub fn sanitize_for_storage(coords: &DiagramCoordinates, dims: &ImageDimensions) -> SanitizeResult {
    sanitize(coords, dims, &SanitizeOptions::storage())
}

// ── Steps ───────────────────────────────────────────────────────────────

fn repair_non_finite(c: &mut DiagramCoordinates, limits: &Limits, rec: &mut Recorder) {
    let mut fixed = false;
    for (v, fallback) in [
        (&mut c.x1, 0.0),
        (&mut c.y1, 0.0),
        (&mut c.x2, limits.width),
        (&mut c.y2, limits.height),
    ] {
        if !v.is_finite() {
            *v = fallback;
            fixed = true;
        }
    }
    if !c.confidence.is_finite() {
        c.confidence = 0.0;
        fixed = true;
    }
    if fixed {
        rec.change(SanitizeChange::NonFinite);
        rec.warn("Replaced non-finite values with image-edge defaults".to_string());
    }
}

fn repair_ordering(c: &mut DiagramCoordinates, rec: &mut Recorder) {
    if c.x1 > c.x2 {
        std::mem::swap(&mut c.x1, &mut c.x2);
        rec.change(SanitizeChange::Ordering);
    }
    if c.y1 > c.y2 {
        std::mem::swap(&mut c.y1, &mut c.y2);
        rec.change(SanitizeChange::Ordering);
    }
}

fn clamp_to_bounds(c: &mut DiagramCoordinates, limits: &Limits) -> bool {
    let before = (c.x1, c.y1, c.x2, c.y2);
    c.x1 = c.x1.clamp(0.0, limits.width);
    c.x2 = c.x2.clamp(0.0, limits.width);
    c.y1 = c.y1.clamp(0.0, limits.height);
    c.y2 = c.y2.clamp(0.0, limits.height);
    before != (c.x1, c.y1, c.x2, c.y2)
}

fn enforce_size(c: &mut DiagramCoordinates, limits: &Limits, rec: &mut Recorder) {
    let (w, h) = (c.width(), c.height());
    let target_w = w.clamp(limits.min_w, limits.max_w);
    let target_h = h.clamp(limits.min_h, limits.max_h);

    if target_w != w {
        (c.x1, c.x2) = resize_axis(c.x1, c.x2, target_w, limits.width);
        rec.change(SanitizeChange::Size);
        if is_significant(w, target_w) {
            rec.warn(resize_warning("width", w, target_w));
        }
    }
    if target_h != h {
        (c.y1, c.y2) = resize_axis(c.y1, c.y2, target_h, limits.height);
        rec.change(SanitizeChange::Size);
        if is_significant(h, target_h) {
            rec.warn(resize_warning("height", h, target_h));
        }
    }
}

fn resize_warning(axis: &str, from: f64, to: f64) -> String {
    if to > from {
        format!("Expanded {axis} from {from:.1} to {to:.1}px to meet the minimum size")
    } else {
        format!("Reduced {axis} from {from:.1} to {to:.1}px to respect the maximum size")
    }
}

fn is_significant(from: f64, to: f64) -> bool {
    from <= 0.0 || (to - from).abs() / from > SIGNIFICANT_RESIZE
}

fn ratio_differs(current: f64, target: f64) -> bool {
    (current - target).abs() / target > RATIO_TOLERANCE
}

fn apply_type_rules(c: &mut DiagramCoordinates, limits: &Limits, rec: &mut Recorder) {
    let Some(ratio) = c.aspect_ratio() else {
        return;
    };
    match c.diagram_type {
        DiagramType::Table if ratio <= TABLE_MIN_RATIO => {
            fit_ratio(c, TABLE_TARGET_RATIO, limits);
            rec.change(SanitizeChange::Type);
            rec.warn("Adjusted table to be wider than tall".to_string());
        }
        DiagramType::Graph if !(GRAPH_MIN_RATIO..=GRAPH_MAX_RATIO).contains(&ratio) => {
            let target = ratio.clamp(GRAPH_MIN_RATIO, GRAPH_MAX_RATIO);
            fit_ratio(c, target, limits);
            rec.change(SanitizeChange::Type);
            rec.warn("Adjusted graph proportions to a readable aspect ratio".to_string());
        }
        DiagramType::Geometric if !(GEOMETRIC_MIN_RATIO..=GEOMETRIC_MAX_RATIO).contains(&ratio) => {
            fit_ratio(c, 1.0, limits);
            rec.change(SanitizeChange::Type);
            rec.warn("Made geometric figure more square".to_string());
        }
        _ => {}
    }
}

/// Resize around the center towards `target` width/height ratio.
///
/// Keeps the height and adjusts the width when that fits the limits,
/// otherwise keeps the width and adjusts the height, otherwise does the
/// closest clamped width.
fn fit_ratio(c: &mut DiagramCoordinates, target: f64, limits: &Limits) {
    let (w, h) = (c.width(), c.height());
    let width_for_h = h * target;
    let height_for_w = w / target;

    if (limits.min_w..=limits.max_w).contains(&width_for_h) {
        (c.x1, c.x2) = resize_axis(c.x1, c.x2, width_for_h, limits.width);
    } else if (limits.min_h..=limits.max_h).contains(&height_for_w) {
        (c.y1, c.y2) = resize_axis(c.y1, c.y2, height_for_w, limits.height);
    } else {
        let new_w = width_for_h.clamp(limits.min_w, limits.max_w);
        let new_h = (new_w / target).clamp(limits.min_h, limits.max_h);
        (c.x1, c.x2) = resize_axis(c.x1, c.x2, new_w, limits.width);
        (c.y1, c.y2) = resize_axis(c.y1, c.y2, new_h, limits.height);
    }
}

fn snap(c: &mut DiagramCoordinates, step: f64) -> bool {
    let before = (c.x1, c.y1, c.x2, c.y2);
    for v in [&mut c.x1, &mut c.y1, &mut c.x2, &mut c.y2] {
        *v = (*v / step).round() * step;
    }
    before != (c.x1, c.y1, c.x2, c.y2)
}

fn adjust_confidence(c: &mut DiagramCoordinates, mode: ConfidenceAdjustment, rec: &mut Recorder) {
    let before = c.confidence;
    let adjusted = match mode {
        ConfidenceAdjustment::Boost => before + CONFIDENCE_BOOST,
        ConfidenceAdjustment::Penalize => {
            before * (1.0 - PENALTY_PER_CHANGE * rec.changes.len() as f64)
        }
        ConfidenceAdjustment::None => before,
    };
    c.confidence = adjusted.clamp(0.0, 1.0);
    if c.confidence != before {
        rec.change(SanitizeChange::Confidence);
    }
}

// ── Invariant maintenance ───────────────────────────────────────────────

/// Re-establish ordering, bounds and size limits after a step.
fn settle(c: &mut DiagramCoordinates, limits: &Limits, rec: &mut Recorder) {
    let before = (c.x1, c.y1, c.x2, c.y2);
    if c.x1 > c.x2 {
        std::mem::swap(&mut c.x1, &mut c.x2);
    }
    if c.y1 > c.y2 {
        std::mem::swap(&mut c.y1, &mut c.y2);
    }
    clamp_to_bounds(c, limits);

    let w = c.width().clamp(limits.min_w, limits.max_w);
    if w != c.width() {
        (c.x1, c.x2) = resize_axis(c.x1, c.x2, w, limits.width);
    }
    let h = c.height().clamp(limits.min_h, limits.max_h);
    if h != c.height() {
        (c.y1, c.y2) = resize_axis(c.y1, c.y2, h, limits.height);
    }

    if before != (c.x1, c.y1, c.x2, c.y2) {
        rec.change(SanitizeChange::Bounds);
    }
}

/// Set the span `lo..hi` to `len`, keeping its center, then shift it
/// inside `0..extent`.
pub(crate) fn resize_axis(lo: f64, hi: f64, len: f64, extent: f64) -> (f64, f64) {
    let center = (lo + hi) / 2.0;
    fit_axis(center - len / 2.0, center + len / 2.0, extent)
}

/// Shift the span `lo..hi` inside `0..extent` without changing its length
/// (unless it is longer than `extent`).
pub(crate) fn fit_axis(lo: f64, hi: f64, extent: f64) -> (f64, f64) {
    let len = (hi - lo).min(extent);
    if lo < 0.0 {
        return (0.0, len);
    }
    if lo + len > extent {
        return (extent - len, extent);
    }
    (lo, lo + len)
}
