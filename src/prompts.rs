//! Prompts for vision-model diagram detection.
//!
//! Keeping every prompt here means the response schema the model is told to
//! produce and the schema [`crate::pipeline::parse`] accepts live side by
//! side. Callers can override the system prompt via
//! [`crate::config::ExtractionConfig::system_prompt`].

/// Default system prompt for detecting questions and diagrams on a page.
///
/// Used when `ExtractionConfig::system_prompt` is `None`.
pub const DETECTION_SYSTEM_PROMPT: &str = r#"You analyse scanned exam question papers. For the page image you receive, find every question and every diagram.

Follow these rules precisely:

1. QUESTIONS
   - One entry per question, in reading order
   - "number" is the printed question number as a string ("1", "12(b)")
   - "text" is the full question text; "options" lists answer choices if any

2. DIAGRAMS
   - A diagram is any figure, graph, chart, table, circuit, map, geometric figure or scientific drawing
   - Give a tight bounding box in image pixels: x1,y1 is the top-left corner, x2,y2 the bottom-right
   - x1 < x2 and y1 < y2; all values inside the image
   - "type" is one of: graph, flowchart, scientific, geometric, table, circuit, map, other
   - "confidence" is your certainty between 0 and 1
   - "questionNumber" is the number of the question the diagram belongs to, if any

3. OUTPUT FORMAT
   - Output ONLY one JSON object, no Markdown fences, no commentary
   - Schema:
     {"questions":[{"number":"1","text":"...","options":["..."]}],
      "diagrams":[{"coordinates":{"x1":0,"y1":0,"x2":0,"y2":0},"type":"graph","confidence":0.9,"description":"...","questionNumber":"1"}]}
   - Use empty arrays when the page has no questions or no diagrams"#;

/// Build the user message that accompanies a page image.
///
/// The model needs the exact pixel size to keep boxes inside the image.
pub fn page_context(page_number: usize, width: u32, height: u32) -> String {
    format!(
        "Page {}. The image is {} pixels wide and {} pixels tall. Return coordinates in this pixel space.",
        page_number, width, height
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_context_mentions_dimensions() {
        let msg = page_context(2, 1654, 2339);
        assert!(msg.starts_with("Page 2."));
        assert!(msg.contains("1654 pixels wide"));
        assert!(msg.contains("2339 pixels tall"));
    }

    #[test]
    fn prompt_lists_every_type() {
        for t in [
            "graph",
            "flowchart",
            "scientific",
            "geometric",
            "table",
            "circuit",
            "map",
            "other",
        ] {
            assert!(DETECTION_SYSTEM_PROMPT.contains(t), "missing {t}");
        }
    }
}
