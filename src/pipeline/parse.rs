//! Turn a detector's JSON into validated, sanitized, per-question diagram
//! metadata.
//!
//! Vision models are loose about shape: numbers arrive as strings, keys get
//! renamed, boxes come as `[x1,y1,x2,y2]` arrays. [`DetectionResponse::from_value`]
//! accepts those variants and drops anything it cannot read. Everything that
//! survives then goes through the geometry validator and sanitizer before it
//! is allowed near storage.

use crate::geometry::{
    sanitize_for_api_response, sanitize_for_storage, validate, validate_array,
    CoordinateMetadata, DiagramCoordinates, DiagramType, ImageDimensions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// ── Raw response ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RawQuestion {
    pub number: String,
    pub text: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDiagram {
    pub coordinates: DiagramCoordinates,
    pub question_number: Option<String>,
}

/// What a detector said about one page, after shape normalisation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResponse {
    pub questions: Vec<RawQuestion>,
    pub diagrams: Vec<RawDiagram>,
    /// Diagram entries that could not be read at all.
    pub unreadable: usize,
}

impl DetectionResponse {
    /// Parse strict JSON text. `None` if the text is not JSON.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<Value>(raw.trim())
            .ok()
            .map(|v| Self::from_value(&v))
    }

    /// Normalise any JSON value into a response.
    ///
    /// A bare array is taken as the diagram list.
    pub fn from_value(value: &Value) -> Self {
        let (questions, diagrams) = match value {
            Value::Array(items) => (&[][..], items.as_slice()),
            Value::Object(map) => (
                map.get("questions")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]),
                map.get("diagrams")
                    .or_else(|| map.get("figures"))
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]),
            ),
            _ => (&[][..], &[][..]),
        };

        let questions = questions
            .iter()
            .enumerate()
            .filter_map(|(i, q)| read_question(i, q))
            .collect();

        let mut unreadable = 0;
        let diagrams = diagrams
            .iter()
            .filter_map(|d| {
                let parsed = read_diagram(d);
                if parsed.is_none() {
                    unreadable += 1;
                }
                parsed
            })
            .collect();

        Self {
            questions,
            diagrams,
            unreadable,
        }
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn label(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn read_question(index: usize, v: &Value) -> Option<RawQuestion> {
    match v {
        Value::String(text) => Some(RawQuestion {
            number: (index + 1).to_string(),
            text: text.clone(),
            options: Vec::new(),
        }),
        Value::Object(obj) => {
            let number = first(obj, &["number", "questionNumber", "id"])
                .and_then(label)
                .unwrap_or_else(|| (index + 1).to_string());
            let text = first(obj, &["text", "question", "content"])
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let options = first(obj, &["options", "choices"])
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(label).collect())
                .unwrap_or_default();
            Some(RawQuestion {
                number,
                text,
                options,
            })
        }
        _ => None,
    }
}

fn read_box(v: &Value) -> Option<[f64; 4]> {
    match v {
        Value::Array(a) if a.len() == 4 => {
            let mut out = [0.0; 4];
            for (slot, item) in out.iter_mut().zip(a) {
                *slot = number(item)?;
            }
            Some(out)
        }
        Value::Object(o) => Some([
            number(o.get("x1")?)?,
            number(o.get("y1")?)?,
            number(o.get("x2")?)?,
            number(o.get("y2")?)?,
        ]),
        _ => None,
    }
}

fn read_diagram(v: &Value) -> Option<RawDiagram> {
    let obj = v.as_object()?;
    let [x1, y1, x2, y2] = first(obj, &["coordinates", "bbox", "box", "boundingBox"])
        .and_then(read_box)
        .or_else(|| read_box(v))?;

    let diagram_type = first(obj, &["type", "diagramType"])
        .and_then(Value::as_str)
        .map(DiagramType::parse)
        .unwrap_or_default();
    let confidence = obj.get("confidence").and_then(number).unwrap_or(0.5);
    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Some(RawDiagram {
        coordinates: DiagramCoordinates::new(x1, y1, x2, y2)
            .with_type(diagram_type)
            .with_confidence(confidence)
            .with_description(description),
        question_number: first(obj, &["questionNumber", "question", "questionId"]).and_then(label),
    })
}

// ── Processed output ─────────────────────────────────────────────────────

/// A question found on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedQuestion {
    pub id: String,
    pub number: String,
    pub text: String,
    pub options: Vec<String>,
    pub page_number: usize,
    pub has_diagram: bool,
}

/// Accepted diagrams on one page, grouped by owning question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDiagrams {
    pub page_number: usize,
    pub dimensions: ImageDimensions,
    pub metadata: Vec<CoordinateMetadata>,
    /// Boxes dropped because no repair made them valid.
    pub rejected: usize,
}

impl PageDiagrams {
    pub fn diagram_count(&self) -> usize {
        self.metadata.iter().map(|m| m.diagrams.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedPage {
    pub questions: Vec<ExtractedQuestion>,
    pub diagrams: PageDiagrams,
    pub warnings: Vec<String>,
}

/// Validate, repair and group the diagrams of one page.
///
/// Valid boxes only get the storage profile. Invalid boxes get the
/// API-response profile first and are dropped if still invalid afterwards.
/// With `allow_overlap == false` the lower-confidence box of each
/// overlapping pair is dropped.
pub fn process_page_diagrams(
    response: &DetectionResponse,
    page_number: usize,
    dims: ImageDimensions,
    id_prefix: &str,
    allow_overlap: bool,
) -> ProcessedPage {
    let mut warnings = Vec::new();
    let mut rejected = response.unreadable;
    if response.unreadable > 0 {
        warnings.push(format!(
            "Page {}: {} diagram entries had no readable coordinates",
            page_number, response.unreadable
        ));
    }

    let mut questions: Vec<ExtractedQuestion> = response
        .questions
        .iter()
        .enumerate()
        .map(|(i, q)| ExtractedQuestion {
            id: format!("{}_p{}_q{}", id_prefix, page_number, i + 1),
            number: q.number.clone(),
            text: q.text.clone(),
            options: q.options.clone(),
            page_number,
            has_diagram: false,
        })
        .collect();

    let mut accepted: Vec<(DiagramCoordinates, Option<&str>)> = Vec::new();
    for (i, raw) in response.diagrams.iter().enumerate() {
        let check = validate(&raw.coordinates, &dims);
        let sanitized = if check.is_valid {
            sanitize_for_storage(&raw.coordinates, &dims).sanitized
        } else {
            let repaired = sanitize_for_api_response(&raw.coordinates, &dims);
            let stored = sanitize_for_storage(&repaired.sanitized, &dims).sanitized;
            let recheck = validate(&stored, &dims);
            if !recheck.is_valid {
                rejected += 1;
                warnings.push(format!(
                    "Page {}: dropped diagram {}: {}",
                    page_number,
                    i + 1,
                    recheck.errors.join("; ")
                ));
                continue;
            }
            debug!(
                "Page {}: repaired diagram {} ({:?})",
                page_number,
                i + 1,
                repaired.changes
            );
            warnings.push(format!(
                "Page {}: repaired diagram {}: {}",
                page_number,
                i + 1,
                check.errors.join("; ")
            ));
            stored
        };
        accepted.push((sanitized, raw.question_number.as_deref()));
    }

    let boxes: Vec<DiagramCoordinates> = accepted.iter().map(|(c, _)| c.clone()).collect();
    let overlap_check = validate_array(&boxes, &dims, allow_overlap);
    let mut dropped = vec![false; accepted.len()];
    for &(a, b) in &overlap_check.overlaps {
        if dropped[a] || dropped[b] {
            continue;
        }
        if allow_overlap {
            warnings.push(format!(
                "Page {}: diagrams {} and {} overlap",
                page_number,
                a + 1,
                b + 1
            ));
        } else {
            let loser = if boxes[b].confidence > boxes[a].confidence { a } else { b };
            dropped[loser] = true;
            rejected += 1;
            warnings.push(format!(
                "Page {}: dropped diagram {} overlapping diagram {}",
                page_number,
                loser + 1,
                if loser == a { b + 1 } else { a + 1 }
            ));
        }
    }

    // Group by owning question, keeping first-seen order.
    let fallback_id = format!("{}_p{}", id_prefix, page_number);
    let mut groups: Vec<(String, Vec<DiagramCoordinates>)> = Vec::new();
    for ((coords, qnum), _) in accepted
        .into_iter()
        .zip(dropped)
        .filter(|(_, dropped)| !dropped)
    {
        let owner = qnum
            .and_then(|n| {
                questions
                    .iter()
                    .position(|q| q.number.eq_ignore_ascii_case(n.trim()))
            })
            .or(if questions.is_empty() { None } else { Some(0) });
        let qid = match owner {
            Some(idx) => {
                questions[idx].has_diagram = true;
                questions[idx].id.clone()
            }
            None => fallback_id.clone(),
        };
        match groups.iter_mut().find(|(id, _)| *id == qid) {
            Some((_, list)) => list.push(coords),
            None => groups.push((qid, vec![coords])),
        }
    }

    let metadata = groups
        .into_iter()
        .map(|(qid, list)| CoordinateMetadata::from_detection(qid, page_number, dims, &list))
        .collect();

    ProcessedPage {
        questions,
        diagrams: PageDiagrams {
            page_number,
            dimensions: dims,
            metadata,
            rejected,
        },
        warnings,
    }
}
