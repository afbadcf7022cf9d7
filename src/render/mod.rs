//! Diagram rendering: crop a box out of a page image, scale it to fit,
//! pad it onto a solid background and return it as a data URL.
//!
//! ## Why cache?
//!
//! The review UI re-renders the same box every time a question is shown.
//! Renders are keyed by source image id, exact coordinates and options, and
//! kept in an LRU cache so repeat views cost a hash lookup.
//!
//! ## Why validate again?
//!
//! Stored boxes were sanitised, but the renderer also serves boxes straight
//! from the editor. A crop outside the image would panic inside `image`, so
//! coordinates are checked here and rejected with a typed [`RenderError`].

pub mod overlay;

pub use overlay::DiagramOverlay;

use crate::error::RenderError;
use crate::geometry::{DiagramCoordinates, ImageDimensions};
use crate::memory::{AllocationMeta, MemoryManager};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Default number of renders kept in the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 50;

/// A page image together with the id renders of it are cached under.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub id: String,
    pub image: Arc<DynamicImage>,
}

impl SourceImage {
    pub fn new(id: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            id: id.into(),
            image: Arc::new(image),
        }
    }

    pub fn dimensions(&self) -> Option<ImageDimensions> {
        ImageDimensions::new(self.image.width(), self.image.height())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    #[default]
    Png,
    Jpeg,
}

impl RasterFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            RasterFormat::Png => "image/png",
            RasterFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub maintain_aspect_ratio: bool,
    pub format: RasterFormat,
    /// JPEG quality, 1–100. Ignored for PNG.
    pub quality: u8,
    /// RGB fill behind transparent pixels and padding.
    pub background_color: [u8; 3],
    /// Border added on every side, in output pixels.
    pub padding: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_width: None,
            max_height: None,
            maintain_aspect_ratio: true,
            format: RasterFormat::Png,
            quality: 90,
            background_color: [255, 255, 255],
            padding: 0,
        }
    }
}

impl RenderOptions {
    fn cache_key(&self) -> String {
        format!(
            "{:?}x{:?}|{}|{:?}|{}|{:?}|{}",
            self.max_width,
            self.max_height,
            self.maintain_aspect_ratio,
            self.format,
            self.quality,
            self.background_color,
            self.padding
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedDiagram {
    /// `data:<mime>;base64,<payload>`
    pub image_data: String,
    pub mime_type: String,
    pub coordinates: DiagramCoordinates,
    /// Output size including padding.
    pub dimensions: ImageDimensions,
    /// Output pixels per source pixel.
    pub scale: f64,
    pub render_time_ms: f64,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct DiagramRequest {
    pub id: String,
    pub coordinates: DiagramCoordinates,
}

#[derive(Debug, Clone)]
pub struct TaggedRender {
    pub id: String,
    pub rendered: RenderedDiagram,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderStats {
    pub total_diagrams: u64,
    pub successful_renders: u64,
    pub failed_renders: u64,
    pub average_render_time_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub struct DiagramRenderer {
    cache: Mutex<LruCache<String, RenderedDiagram>>,
    stats: Mutex<RenderStats>,
    memory: Option<Arc<MemoryManager>>,
}

impl Default for DiagramRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl DiagramRenderer {
    /// A capacity of 0 is treated as 1.
    pub fn new(cache_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
            stats: Mutex::new(RenderStats::default()),
            memory: None,
        }
    }

    /// Register every output buffer with `memory` while it is being built.
    pub fn with_memory_manager(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Crop, scale, pad and encode one diagram.
    pub fn render_diagram(
        &self,
        source: &SourceImage,
        coords: &DiagramCoordinates,
        options: &RenderOptions,
    ) -> Result<RenderedDiagram, RenderError> {
        let started = Instant::now();
        let key = format!(
            "{}|{:?},{:?},{:?},{:?}|{}",
            source.id,
            coords.x1,
            coords.y1,
            coords.x2,
            coords.y2,
            options.cache_key()
        );

        let cached = self.cache.lock().ok().and_then(|mut c| c.get(&key).cloned());
        if let Some(mut hit) = cached {
            hit.from_cache = true;
            hit.render_time_ms = elapsed_ms(started);
            self.record(Some(hit.render_time_ms), true);
            return Ok(hit);
        }

        match self.render_uncached(source, coords, options) {
            Ok(mut rendered) => {
                rendered.render_time_ms = elapsed_ms(started);
                debug!(
                    "Rendered {} → {}x{} in {:.1} ms",
                    source.id,
                    rendered.dimensions.width,
                    rendered.dimensions.height,
                    rendered.render_time_ms
                );
                if let Ok(mut c) = self.cache.lock() {
                    c.put(key, rendered.clone());
                }
                self.record(Some(rendered.render_time_ms), false);
                Ok(rendered)
            }
            Err(e) => {
                self.record(None, false);
                Err(e)
            }
        }
    }

    fn render_uncached(
        &self,
        source: &SourceImage,
        coords: &DiagramCoordinates,
        options: &RenderOptions,
    ) -> Result<RenderedDiagram, RenderError> {
        let img = &source.image;
        let (iw, ih) = (img.width(), img.height());
        check_coordinates(coords, iw, ih)?;

        let x = coords.x1.floor() as u32;
        let y = coords.y1.floor() as u32;
        let w = ((coords.x2.ceil() as u32).min(iw) - x).max(1);
        let h = ((coords.y2.ceil() as u32).min(ih) - y).max(1);
        let crop = img.crop_imm(x, y, w, h);

        let (tw, th, scale) = target_size(w, h, options);
        let pad = options.padding;
        let padded = |side: u32| pad.checked_mul(2).and_then(|p| side.checked_add(p));
        let (Some(ow), Some(oh)) = (padded(tw), padded(th)) else {
            return Err(RenderError::PaddingTooLarge { padding: pad });
        };

        let scaled = if (tw, th) != (w, h) {
            crop.resize_exact(tw, th, FilterType::Lanczos3)
        } else {
            crop
        };

        let reservation = match &self.memory {
            Some(m) => Some(
                m.allocate_memory(
                    u64::from(ow) * u64::from(oh) * 4,
                    AllocationMeta::pinned("render_buffer"),
                )
                .map_err(|e| RenderError::OutOfMemory(e.to_string()))?,
            ),
            None => None,
        };

        let [r, g, b] = options.background_color;
        let mut canvas = RgbaImage::from_pixel(ow, oh, Rgba([r, g, b, 255]));
        image::imageops::overlay(&mut canvas, &scaled.to_rgba8(), i64::from(pad), i64::from(pad));
        let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();

        let mut buf = Vec::new();
        let encoded = match options.format {
            RasterFormat::Png => DynamicImage::ImageRgb8(rgb)
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png),
            RasterFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut buf, options.quality.clamp(1, 100))
                    .encode_image(&rgb)
            }
        };

        if let (Some(m), Some(id)) = (&self.memory, reservation) {
            m.release_allocation(id);
        }
        encoded.map_err(|e| RenderError::Encode(e.to_string()))?;

        let mime = options.format.mime_type();
        Ok(RenderedDiagram {
            image_data: format!("data:{};base64,{}", mime, STANDARD.encode(&buf)),
            mime_type: mime.to_string(),
            coordinates: coords.clone(),
            dimensions: ImageDimensions { width: ow, height: oh },
            scale,
            render_time_ms: 0.0,
            from_cache: false,
        })
    }

    /// Render several boxes from one page. Failures are logged and skipped.
    pub fn render_multiple_diagrams(
        &self,
        source: &SourceImage,
        requests: &[DiagramRequest],
        options: &RenderOptions,
    ) -> Vec<TaggedRender> {
        requests
            .iter()
            .filter_map(|req| match self.render_diagram(source, &req.coordinates, options) {
                Ok(rendered) => Some(TaggedRender {
                    id: req.id.clone(),
                    rendered,
                }),
                Err(e) => {
                    warn!("Skipping diagram {}: {}", req.id, e);
                    None
                }
            })
            .collect()
    }

    /// Render sized to fit a display container, keeping proportions.
    pub fn create_responsive_diagram(
        &self,
        source: &SourceImage,
        coords: &DiagramCoordinates,
        container_width: u32,
        container_height: u32,
    ) -> Result<RenderedDiagram, RenderError> {
        let options = RenderOptions {
            max_width: Some(container_width.max(1)),
            max_height: Some(container_height.max(1)),
            maintain_aspect_ratio: true,
            ..RenderOptions::default()
        };
        self.render_diagram(source, coords, &options)
    }

    pub fn create_overlay(
        &self,
        coords: &DiagramCoordinates,
        original: &ImageDimensions,
    ) -> DiagramOverlay {
        DiagramOverlay::new(coords, original)
    }

    pub fn clear_cache(&self) {
        if let Ok(mut c) = self.cache.lock() {
            c.clear();
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> RenderStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        if let Ok(mut s) = self.stats.lock() {
            *s = RenderStats::default();
        }
    }

    fn record(&self, render_ms: Option<f64>, hit: bool) {
        let Ok(mut s) = self.stats.lock() else {
            return;
        };
        s.total_diagrams += 1;
        match render_ms {
            Some(ms) => {
                s.successful_renders += 1;
                let n = s.successful_renders as f64;
                s.average_render_time_ms += (ms - s.average_render_time_ms) / n;
                if hit {
                    s.cache_hits += 1;
                } else {
                    s.cache_misses += 1;
                }
            }
            None => {
                s.failed_renders += 1;
                s.cache_misses += 1;
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn check_coordinates(c: &DiagramCoordinates, width: u32, height: u32) -> Result<(), RenderError> {
    if ![c.x1, c.y1, c.x2, c.y2].iter().all(|v| v.is_finite()) {
        return Err(RenderError::NonFinite);
    }
    if c.x1 < 0.0 || c.y1 < 0.0 {
        return Err(RenderError::NegativeCoordinates { x1: c.x1, y1: c.y1 });
    }
    if c.x2 <= c.x1 || c.y2 <= c.y1 {
        return Err(RenderError::InvalidOrdering);
    }
    if c.x2 > width as f64 || c.y2 > height as f64 {
        return Err(RenderError::OutOfBounds {
            x2: c.x2,
            y2: c.y2,
            width,
            height,
        });
    }
    Ok(())
}

/// Output size for a `w`×`h` crop. Never upscales.
fn target_size(w: u32, h: u32, opts: &RenderOptions) -> (u32, u32, f64) {
    let (wf, hf) = (w as f64, h as f64);
    if opts.maintain_aspect_ratio {
        let sx = opts.max_width.map_or(1.0, |m| m as f64 / wf);
        let sy = opts.max_height.map_or(1.0, |m| m as f64 / hf);
        let s = sx.min(sy).min(1.0);
        if s >= 1.0 {
            return (w, h, 1.0);
        }
        let tw = ((wf * s).round() as u32).max(1);
        let th = ((hf * s).round() as u32).max(1);
        (tw, th, s)
    } else {
        let tw = opts.max_width.map_or(w, |m| m.min(w)).max(1);
        let th = opts.max_height.map_or(h, |m| m.min(h)).max(1);
        (tw, th, tw as f64 / wf)
    }
}
