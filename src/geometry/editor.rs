//! Interactive drag/resize/move editing of a single diagram box.
//!
//! Pointer positions arrive in canvas space (zoomed and panned); every
//! operation converts them to image space with
//! `image = (canvas - offset) / scale` before touching coordinates, so
//! editing behaves identically at any zoom level.
//!
//! Each update re-applies the minimum size and image bounds, so the box held
//! by the editor is valid at every moment of a drag, not just at the end.

use super::sanitize::{fit_axis, sanitize_for_manual_edit};
use super::types::{DiagramCoordinates, ImageDimensions, Point};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which part of the box a drag grabbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DragHandle {
    #[serde(rename = "tl")]
    TopLeft,
    #[serde(rename = "tr")]
    TopRight,
    #[serde(rename = "bl")]
    BottomLeft,
    #[serde(rename = "br")]
    BottomRight,
    #[serde(rename = "move")]
    Move,
}

impl DragHandle {
    pub fn as_str(&self) -> &'static str {
        match self {
            DragHandle::TopLeft => "tl",
            DragHandle::TopRight => "tr",
            DragHandle::BottomLeft => "bl",
            DragHandle::BottomRight => "br",
            DragHandle::Move => "move",
        }
    }

    fn x_edit(&self) -> AxisEdit {
        match self {
            DragHandle::TopLeft | DragHandle::BottomLeft => AxisEdit::Low,
            DragHandle::TopRight | DragHandle::BottomRight => AxisEdit::High,
            DragHandle::Move => AxisEdit::Translate,
        }
    }

    fn y_edit(&self) -> AxisEdit {
        match self {
            DragHandle::TopLeft | DragHandle::TopRight => AxisEdit::Low,
            DragHandle::BottomLeft | DragHandle::BottomRight => AxisEdit::High,
            DragHandle::Move => AxisEdit::Translate,
        }
    }
}

/// A single coordinate targeted by numeric input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateField {
    X1,
    Y1,
    X2,
    Y2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisEdit {
    Low,
    High,
    Translate,
    Fixed,
}

/// Canvas zoom and pan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewTransform {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

/// Editor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorConfig {
    /// Hit radius around corners, in canvas pixels.
    pub handle_tolerance: f64,
    /// Minimum width and height in image pixels.
    pub min_size: f64,
    /// Grid applied while dragging; `end_edit` always snaps to the
    /// manual-edit grid.
    pub snap_to_grid: Option<f64>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            handle_tolerance: 8.0,
            min_size: 20.0,
            snap_to_grid: None,
        }
    }
}

/// Observable drag state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorState {
    pub is_dragging: bool,
    pub drag_handle: Option<DragHandle>,
    pub start_position: Option<Point>,
    pub start_coordinates: Option<DiagramCoordinates>,
    pub current_coordinates: DiagramCoordinates,
}

/// Stateful editor for one box on one page image.
#[derive(Debug, Clone)]
pub struct CoordinateEditor {
    state: EditorState,
    original: DiagramCoordinates,
    dims: ImageDimensions,
    view: ViewTransform,
    config: EditorConfig,
}

impl CoordinateEditor {
    pub fn new(coords: DiagramCoordinates, dims: ImageDimensions, config: EditorConfig) -> Self {
        Self {
            state: EditorState {
                is_dragging: false,
                drag_handle: None,
                start_position: None,
                start_coordinates: None,
                current_coordinates: coords.clone(),
            },
            original: coords,
            dims,
            view: ViewTransform::default(),
            config,
        }
    }

    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn coordinates(&self) -> &DiagramCoordinates {
        &self.state.current_coordinates
    }

    pub fn original(&self) -> &DiagramCoordinates {
        &self.original
    }

    pub fn is_dragging(&self) -> bool {
        self.state.is_dragging
    }

    pub fn view_transform(&self) -> ViewTransform {
        self.view
    }

    pub fn set_view_transform(&mut self, view: ViewTransform) {
        if view.scale.is_finite() && view.scale > 0.0 {
            self.view = view;
        }
    }

    /// Replace both the working box and the reset snapshot.
    pub fn set_coordinates(&mut self, coords: DiagramCoordinates) {
        self.original = coords.clone();
        self.state.current_coordinates = coords;
        self.clear_drag();
    }

    pub fn canvas_to_image(&self, p: Point) -> Point {
        Point::new(
            (p.x - self.view.offset_x) / self.view.scale,
            (p.y - self.view.offset_y) / self.view.scale,
        )
    }

    pub fn image_to_canvas(&self, p: Point) -> Point {
        Point::new(
            p.x * self.view.scale + self.view.offset_x,
            p.y * self.view.scale + self.view.offset_y,
        )
    }

    /// Nearest corner within tolerance, else `Move` inside the box, else `None`.
    pub fn get_handle_at_position(&self, canvas: Point) -> Option<DragHandle> {
        let p = self.canvas_to_image(canvas);
        let c = &self.state.current_coordinates;
        let tolerance = self.config.handle_tolerance / self.view.scale;

        let corners = [
            (DragHandle::TopLeft, c.x1, c.y1),
            (DragHandle::TopRight, c.x2, c.y1),
            (DragHandle::BottomLeft, c.x1, c.y2),
            (DragHandle::BottomRight, c.x2, c.y2),
        ];
        let nearest = corners
            .iter()
            .map(|(h, x, y)| (*h, (p.x - x).hypot(p.y - y)))
            .filter(|(_, d)| *d <= tolerance)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((handle, _)) = nearest {
            return Some(handle);
        }

        let inside = p.x > c.x1.min(c.x2)
            && p.x < c.x1.max(c.x2)
            && p.y > c.y1.min(c.y2)
            && p.y < c.y1.max(c.y2);
        inside.then_some(DragHandle::Move)
    }

    /// CSS cursor for a handle on the current box.
    pub fn cursor_for_handle(&self, handle: Option<DragHandle>) -> &'static str {
        cursor_for(handle, &self.state.current_coordinates)
    }

    /// Begin a drag at `canvas`. Returns `false` when no handle is hit.
    pub fn start_edit(&mut self, canvas: Point) -> bool {
        let Some(handle) = self.get_handle_at_position(canvas) else {
            return false;
        };
        debug!("Editor: start {} drag", handle.as_str());
        self.state.is_dragging = true;
        self.state.drag_handle = Some(handle);
        self.state.start_position = Some(self.canvas_to_image(canvas));
        self.state.start_coordinates = Some(self.state.current_coordinates.clone());
        true
    }

    /// Apply the pointer at `canvas` to the active drag.
    ///
    /// Returns the constrained box, or `None` when no drag is active.
    pub fn update_edit(&mut self, canvas: Point) -> Option<DiagramCoordinates> {
        if !self.state.is_dragging {
            return None;
        }
        let (handle, start_pos, start) = match (
            self.state.drag_handle,
            self.state.start_position,
            self.state.start_coordinates.as_ref(),
        ) {
            (Some(h), Some(p), Some(s)) => (h, p, s.clone()),
            _ => return None,
        };

        let p = self.canvas_to_image(canvas);
        let (dx, dy) = (p.x - start_pos.x, p.y - start_pos.y);
        let mut next = start.clone();
        match handle {
            DragHandle::Move => {
                next.x1 += dx;
                next.x2 += dx;
                next.y1 += dy;
                next.y2 += dy;
            }
            _ => {
                match handle.x_edit() {
                    AxisEdit::Low => next.x1 += dx,
                    _ => next.x2 += dx,
                }
                match handle.y_edit() {
                    AxisEdit::Low => next.y1 += dy,
                    _ => next.y2 += dy,
                }
            }
        }

        let constrained = self.constrain(next, handle.x_edit(), handle.y_edit());
        self.state.current_coordinates = constrained.clone();
        Some(constrained)
    }

    /// Finish the drag, run the manual-edit sanitiser and return the box.
    pub fn end_edit(&mut self) -> Option<DiagramCoordinates> {
        if !self.state.is_dragging {
            return None;
        }
        let result = sanitize_for_manual_edit(&self.state.current_coordinates, &self.dims);
        self.state.current_coordinates = result.sanitized.clone();
        self.clear_drag();
        Some(result.sanitized)
    }

    /// Abort the active drag, restoring the box it started from.
    ///
    /// Outside of a drag this restores the original snapshot.
    pub fn cancel_edit(&mut self) {
        let restore = self
            .state
            .start_coordinates
            .take()
            .unwrap_or_else(|| self.original.clone());
        self.state.current_coordinates = restore;
        self.clear_drag();
    }

    /// Restore the original snapshot unconditionally.
    pub fn reset(&mut self) {
        self.state.current_coordinates = self.original.clone();
        self.clear_drag();
    }

    /// Set one coordinate from numeric input, with drag constraints.
    pub fn update_coordinates_from_input(
        &mut self,
        field: CoordinateField,
        value: f64,
    ) -> DiagramCoordinates {
        if !value.is_finite() {
            return self.state.current_coordinates.clone();
        }
        let mut next = self.state.current_coordinates.clone();
        let (x_edit, y_edit) = match field {
            CoordinateField::X1 => {
                next.x1 = value;
                (AxisEdit::Low, AxisEdit::Fixed)
            }
            CoordinateField::X2 => {
                next.x2 = value;
                (AxisEdit::High, AxisEdit::Fixed)
            }
            CoordinateField::Y1 => {
                next.y1 = value;
                (AxisEdit::Fixed, AxisEdit::Low)
            }
            CoordinateField::Y2 => {
                next.y2 = value;
                (AxisEdit::Fixed, AxisEdit::High)
            }
        };
        let constrained = self.constrain(next, x_edit, y_edit);
        self.state.current_coordinates = constrained.clone();
        constrained
    }

    fn clear_drag(&mut self) {
        self.state.is_dragging = false;
        self.state.drag_handle = None;
        self.state.start_position = None;
        self.state.start_coordinates = None;
    }

    fn constrain(&self, mut c: DiagramCoordinates, x: AxisEdit, y: AxisEdit) -> DiagramCoordinates {
        let (w, h) = (self.dims.width_f(), self.dims.height_f());
        let min_w = self.config.min_size.min(w);
        let min_h = self.config.min_size.min(h);
        let grid = self.config.snap_to_grid.filter(|g| g.is_finite() && *g > 0.0);
        (c.x1, c.x2) = constrain_axis(c.x1, c.x2, x, min_w, w, grid);
        (c.y1, c.y2) = constrain_axis(c.y1, c.y2, y, min_h, h, grid);
        c
    }
}

fn snap_value(v: f64, grid: Option<f64>) -> f64 {
    match grid {
        Some(g) => (v / g).round() * g,
        None => v,
    }
}

/// Keep one axis ordered, within `0..extent` and at least `min` long,
/// moving only the edge that the user is editing.
fn constrain_axis(
    lo: f64,
    hi: f64,
    edit: AxisEdit,
    min: f64,
    extent: f64,
    grid: Option<f64>,
) -> (f64, f64) {
    match edit {
        AxisEdit::Translate => {
            let len = hi - lo;
            let lo = snap_value(lo, grid);
            fit_axis(lo, lo + len, extent)
        }
        AxisEdit::Low => {
            let hi = hi.clamp(0.0, extent);
            let lo = snap_value(lo, grid).clamp(0.0, (hi - min).max(0.0));
            (lo, hi.max(lo + min).min(extent))
        }
        AxisEdit::High => {
            let lo = lo.clamp(0.0, extent);
            let hi = snap_value(hi, grid).clamp((lo + min).min(extent), extent);
            ((lo.min(hi - min)).max(0.0), hi)
        }
        AxisEdit::Fixed => {
            let (lo, hi) = (lo.min(hi), lo.max(hi));
            if hi - lo < min {
                let center = (lo + hi) / 2.0;
                fit_axis(center - min / 2.0, center + min / 2.0, extent)
            } else {
                fit_axis(lo, hi, extent)
            }
        }
    }
}

/// Resize cursor for `handle`, mirrored when the box has been flipped.
///
/// A box with zero or negative width (or height) before normalisation
/// mirrors the corner horizontally (or vertically), so `tl` on such a box
/// reports the cursor family `tr` would on a normal one.
pub fn cursor_for(handle: Option<DragHandle>, coords: &DiagramCoordinates) -> &'static str {
    let Some(handle) = handle else {
        return "default";
    };
    if handle == DragHandle::Move {
        return "move";
    }
    let flip_x = coords.width() <= 0.0;
    let flip_y = coords.height() <= 0.0;
    let left = matches!(handle, DragHandle::TopLeft | DragHandle::BottomLeft) != flip_x;
    let top = matches!(handle, DragHandle::TopLeft | DragHandle::TopRight) != flip_y;
    match (top, left) {
        (true, true) => "nw-resize",
        (true, false) => "ne-resize",
        (false, true) => "sw-resize",
        (false, false) => "se-resize",
    }
}
