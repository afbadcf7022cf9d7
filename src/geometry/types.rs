//! Core geometry records: bounding boxes, image dimensions and the
//! per-question coordinate metadata persisted by the store.
//!
//! Every record serialises with camelCase keys so the JSON written to the
//! store matches what the detection API and the exam renderer exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic class the detector assigned to a diagram.
///
/// Unknown labels coming back from the API collapse to [`DiagramType::Other`]
/// instead of failing deserialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum DiagramType {
    Graph,
    Flowchart,
    Scientific,
    Geometric,
    Table,
    Circuit,
    Map,
    #[default]
    Other,
}

impl DiagramType {
    /// Parse a label case-insensitively, mapping anything unknown to `Other`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "graph" | "chart" | "plot" => DiagramType::Graph,
            "flowchart" | "flow" => DiagramType::Flowchart,
            "scientific" | "science" => DiagramType::Scientific,
            "geometric" | "geometry" => DiagramType::Geometric,
            "table" => DiagramType::Table,
            "circuit" => DiagramType::Circuit,
            "map" => DiagramType::Map,
            _ => DiagramType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiagramType::Graph => "graph",
            DiagramType::Flowchart => "flowchart",
            DiagramType::Scientific => "scientific",
            DiagramType::Geometric => "geometric",
            DiagramType::Table => "table",
            DiagramType::Circuit => "circuit",
            DiagramType::Map => "map",
            DiagramType::Other => "other",
        }
    }
}

impl From<String> for DiagramType {
    fn from(s: String) -> Self {
        DiagramType::parse(&s)
    }
}

impl fmt::Display for DiagramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned bounding box of a diagram on a page image, in image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramCoordinates {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(rename = "type", default)]
    pub diagram_type: DiagramType,
    #[serde(default)]
    pub description: String,
}

impl DiagramCoordinates {
    /// A box with confidence 1.0, type `Other` and no description.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence: 1.0,
            diagram_type: DiagramType::Other,
            description: String::new(),
        }
    }

    pub fn with_type(mut self, diagram_type: DiagramType) -> Self {
        self.diagram_type = diagram_type;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Width divided by height; `None` for degenerate boxes.
    pub fn aspect_ratio(&self) -> Option<f64> {
        let h = self.height();
        if h > 0.0 {
            Some(self.width() / h)
        } else {
            None
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2, self.confidence]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Area shared with `other` (0 when disjoint or only touching).
    pub fn intersection_area(&self, other: &DiagramCoordinates) -> f64 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        if w > 0.0 && h > 0.0 {
            w * h
        } else {
            0.0
        }
    }

    /// True when the two rectangles share a strictly positive area.
    pub fn overlaps(&self, other: &DiagramCoordinates) -> bool {
        self.intersection_area(other) > 0.0
    }
}

/// Pixel size of the page image a box is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    /// Returns `None` when either side is zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            None
        } else {
            Some(Self { width, height })
        }
    }

    pub fn width_f(&self) -> f64 {
        self.width as f64
    }

    pub fn height_f(&self) -> f64 {
        self.height as f64
    }
}

/// A point in either canvas or image space, depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Who last produced a stored diagram box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifiedBy {
    Ai,
    User,
}

/// One stored diagram inside a question's [`CoordinateMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramRecord {
    pub id: String,
    pub coordinates: DiagramCoordinates,
    #[serde(rename = "type")]
    pub diagram_type: DiagramType,
    pub description: String,
    pub confidence: f64,
    pub last_modified: DateTime<Utc>,
    pub modified_by: ModifiedBy,
}

/// Aggregate of every diagram box belonging to one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinateMetadata {
    pub question_id: String,
    pub page_number: usize,
    pub original_image_dimensions: ImageDimensions,
    pub diagrams: Vec<DiagramRecord>,
}

impl CoordinateMetadata {
    /// Build the metadata for freshly extracted boxes (`modifiedBy = ai`).
    ///
    /// Diagram ids are `{question_id}_diagram_{n}` with `n` starting at 1.
    pub fn from_detection(
        question_id: impl Into<String>,
        page_number: usize,
        dims: ImageDimensions,
        boxes: &[DiagramCoordinates],
    ) -> Self {
        let question_id = question_id.into();
        let now = Utc::now();
        let diagrams = boxes
            .iter()
            .enumerate()
            .map(|(i, c)| DiagramRecord {
                id: format!("{}_diagram_{}", question_id, i + 1),
                coordinates: c.clone(),
                diagram_type: c.diagram_type,
                description: c.description.clone(),
                confidence: c.confidence,
                last_modified: now,
                modified_by: ModifiedBy::Ai,
            })
            .collect();

        Self {
            question_id,
            page_number,
            original_image_dimensions: dims,
            diagrams,
        }
    }

    /// Replace the box of diagram `id`. Returns `false` if no such diagram.
    pub fn update_diagram(
        &mut self,
        id: &str,
        coordinates: DiagramCoordinates,
        modified_by: ModifiedBy,
    ) -> bool {
        let Some(record) = self.diagrams.iter_mut().find(|d| d.id == id) else {
            return false;
        };
        record.diagram_type = coordinates.diagram_type;
        record.description = coordinates.description.clone();
        record.confidence = coordinates.confidence;
        record.coordinates = coordinates;
        record.last_modified = Utc::now();
        record.modified_by = modified_by;
        true
    }

    pub fn remove_diagram(&mut self, id: &str) -> bool {
        let before = self.diagrams.len();
        self.diagrams.retain(|d| d.id != id);
        self.diagrams.len() != before
    }
}
