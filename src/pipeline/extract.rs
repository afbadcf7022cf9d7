//! Page extraction: turn a PDF into page images, page text and document
//! metadata.
//!
//! The orchestrator only sees the [`PageExtractor`] trait, so tests and
//! alternative engines plug in without touching session code.
//! [`PdfiumPageExtractor`] is the production engine.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and CPU-heavy rendering.
//! `tokio::task::spawn_blocking` keeps it off the async worker threads.
//!
//! ## Why cap pixels?
//!
//! Page sizes vary wildly. `max_rendered_pixels` caps the longest edge so
//! memory stays bounded and the images match what vision models handle well.
//! Diagram coordinates are expressed in this rendered pixel space.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::geometry::ImageDimensions;
use crate::pipeline::input::InputFile;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// One rasterised page plus its text layer.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-indexed.
    pub page_number: usize,
    pub image: Arc<DynamicImage>,
    pub dimensions: ImageDimensions,
    pub text: String,
    pub has_images: bool,
    /// Confidence in `text`: 1.0 for a real text layer, 0.0 for none.
    pub confidence: f64,
}

impl PageImage {
    /// Wrap an already-rendered page. `None` for a zero-sized image.
    pub fn new(page_number: usize, image: DynamicImage, text: impl Into<String>) -> Option<Self> {
        let dimensions = ImageDimensions::new(image.width(), image.height())?;
        let text = text.into();
        let confidence = if text.trim().is_empty() { 0.0 } else { 1.0 };
        Some(Self {
            page_number,
            image: Arc::new(image),
            dimensions,
            text,
            has_images: false,
            confidence,
        })
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            page_number: self.page_number,
            text: self.text.clone(),
            has_images: self.has_images,
            confidence: self.confidence,
        }
    }
}

/// Serializable summary of a page, without pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page_number: usize,
    pub text: String,
    pub has_images: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    /// Text of every page, joined by blank lines.
    pub text: String,
    pub page_count: usize,
    pub pages: Vec<PageImage>,
    pub metadata: DocumentMetadata,
}

impl ExtractedDocument {
    pub fn from_pages(pages: Vec<PageImage>, metadata: DocumentMetadata) -> Self {
        let text = pages
            .iter()
            .map(|p| p.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        Self {
            text,
            page_count: pages.len(),
            pages,
            metadata,
        }
    }

    pub fn page_info(&self) -> Vec<PageInfo> {
        self.pages.iter().map(PageImage::info).collect()
    }
}

/// Source of page images and text for one input file.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, file: &InputFile) -> Result<ExtractedDocument, ExtractError>;
}

/// pdfium-backed extractor.
#[derive(Debug, Clone)]
pub struct PdfiumPageExtractor {
    max_rendered_pixels: u32,
    password: Option<String>,
}

impl PdfiumPageExtractor {
    pub fn new(max_rendered_pixels: u32) -> Self {
        Self {
            max_rendered_pixels: max_rendered_pixels.max(100),
            password: None,
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            max_rendered_pixels: config.max_rendered_pixels,
            password: config.password.clone(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

#[async_trait]
impl PageExtractor for PdfiumPageExtractor {
    async fn extract(&self, file: &InputFile) -> Result<ExtractedDocument, ExtractError> {
        if !file.data.starts_with(b"%PDF") {
            return Err(ExtractError::NotAPdf {
                magic: file.data.iter().take(4).copied().collect(),
            });
        }

        let data = Arc::clone(&file.data);
        let max_px = self.max_rendered_pixels;
        let password = self.password.clone();
        let name = file.name.clone();

        let doc = tokio::task::spawn_blocking(move || {
            extract_blocking(&data, max_px, password.as_deref())
        })
        .await
        .map_err(|e| ExtractError::Task(format!("Extraction task panicked: {}", e)))??;

        info!("{}: extracted {} pages", name, doc.page_count);
        Ok(doc)
    }
}

/// Blocking implementation of extraction.
fn extract_blocking(
    data: &[u8],
    max_pixels: u32,
    password: Option<&str>,
) -> Result<ExtractedDocument, ExtractError> {
    let pdfium = Pdfium::default();

    let document = pdfium
        .load_pdf_from_byte_slice(data, password)
        .map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                ExtractError::PasswordRequired
            } else {
                ExtractError::Corrupt(err_str)
            }
        })?;

    let metadata_tags = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata_tags.get(tag).and_then(|t| {
            let v = t.value().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    let pages = document.pages();
    let total_pages = pages.len() as usize;

    let metadata = DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        page_count: total_pages,
        pdf_version: format!("{:?}", document.version()),
    };

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(total_pages);

    for idx in 0..total_pages {
        let page_number = idx + 1;
        let page = pages
            .get(idx as u16)
            .map_err(|e| ExtractError::RasterisationFailed {
                page: page_number,
                detail: format!("{:?}", e),
            })?;

        let text = page.text().map(|t| t.all()).unwrap_or_default();
        let has_images = page
            .objects()
            .iter()
            .any(|o| o.object_type() == PdfPageObjectType::Image);

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            ExtractError::RasterisationFailed {
                page: page_number,
                detail: format!("{:?}", e),
            }
        })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_number,
            image.width(),
            image.height()
        );

        let mut page_image = PageImage::new(page_number, image, text).ok_or_else(|| {
            ExtractError::RasterisationFailed {
                page: page_number,
                detail: "rendered image is empty".into(),
            }
        })?;
        page_image.has_images = has_images;
        results.push(page_image);
    }

    Ok(ExtractedDocument::from_pages(results, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
    }

    #[test]
    fn page_confidence_follows_text_layer() {
        let p = PageImage::new(1, blank(10, 10), "Q1. Find x").unwrap();
        assert_eq!(p.confidence, 1.0);
        assert_eq!(p.dimensions, ImageDimensions { width: 10, height: 10 });
        let scanned = PageImage::new(2, blank(10, 10), "  ").unwrap();
        assert_eq!(scanned.confidence, 0.0);
        assert!(PageImage::new(3, blank(0, 10), "").is_none());
    }

    #[test]
    fn document_text_joins_pages() {
        let pages = vec![
            PageImage::new(1, blank(4, 4), "first").unwrap(),
            PageImage::new(2, blank(4, 4), "").unwrap(),
            PageImage::new(3, blank(4, 4), "third").unwrap(),
        ];
        let doc = ExtractedDocument::from_pages(pages, DocumentMetadata::default());
        assert_eq!(doc.page_count, 3);
        assert_eq!(doc.text, "first\n\nthird");
        assert_eq!(doc.page_info()[2].page_number, 3);
    }

    #[tokio::test]
    async fn non_pdf_rejected_before_pdfium() {
        let extractor = PdfiumPageExtractor::new(1000);
        let err = extractor
            .extract(&InputFile::new("x.pdf", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::NotAPdf { .. }));
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
    }
}
