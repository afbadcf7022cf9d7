//! Percentage-positioned overlays for drawing diagram boxes on top of a
//! scaled page image.

use crate::geometry::{DiagramCoordinates, DiagramType, ImageDimensions};
use serde::{Deserialize, Serialize};

/// A box expressed as percentages of the page, so it tracks the image at any
/// display size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramOverlay {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub diagram_type: DiagramType,
    pub confidence: f64,
}

impl DiagramOverlay {
    pub fn new(coords: &DiagramCoordinates, original: &ImageDimensions) -> Self {
        let (w, h) = (original.width_f(), original.height_f());
        Self {
            left: coords.x1 / w * 100.0,
            top: coords.y1 / h * 100.0,
            width: coords.width() / w * 100.0,
            height: coords.height() / h * 100.0,
            diagram_type: coords.diagram_type,
            confidence: coords.confidence,
        }
    }

    /// Data attributes carried by the overlay element.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        vec![
            ("data-diagram-type", self.diagram_type.to_string()),
            ("data-confidence", format!("{:.2}", self.confidence)),
        ]
    }

    pub fn style(&self) -> String {
        format!(
            "position:absolute;left:{:.2}%;top:{:.2}%;width:{:.2}%;height:{:.2}%",
            self.left, self.top, self.width, self.height
        )
    }

    /// An absolutely-positioned, empty `div` for the overlay.
    pub fn to_html(&self) -> String {
        let attrs: String = self
            .attributes()
            .into_iter()
            .map(|(k, v)| format!(" {}=\"{}\"", k, v))
            .collect();
        format!(
            "<div class=\"diagram-overlay\" style=\"{}\"{}></div>",
            self.style(),
            attrs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages() {
        let dims = ImageDimensions::new(800, 600).unwrap();
        let c = DiagramCoordinates::new(100.0, 150.0, 300.0, 250.0)
            .with_type(DiagramType::Graph)
            .with_confidence(0.9);
        let o = DiagramOverlay::new(&c, &dims);
        assert_eq!(o.left, 12.5);
        assert_eq!(o.top, 25.0);
        assert_eq!(o.width, 25.0);
        assert!((o.height - 16.666).abs() < 0.01);
    }

    #[test]
    fn html_carries_type_and_confidence() {
        let dims = ImageDimensions::new(800, 600).unwrap();
        let c = DiagramCoordinates::new(0.0, 0.0, 400.0, 300.0)
            .with_type(DiagramType::Table)
            .with_confidence(0.75);
        let html = DiagramOverlay::new(&c, &dims).to_html();
        assert!(html.starts_with("<div class=\"diagram-overlay\""));
        assert!(html.contains("left:0.00%"));
        assert!(html.contains("width:50.00%"));
        assert!(html.contains("data-diagram-type=\"table\""));
        assert!(html.contains("data-confidence=\"0.75\""));
    }
}
