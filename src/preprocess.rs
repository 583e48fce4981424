//! Image cleanup before OCR: grayscale, size normalisation, contrast and sharpening.
//!
//! Failures never abort a request; the original bytes are used instead.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use tracing::{debug, warn};

use crate::config::PreprocessConfig;
use crate::ocr::{Document, DocumentKind};

#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Enhanced copy of an image document, or `None` when nothing was done.
    pub fn prepare(&self, document: &Document) -> Option<Document> {
        if !self.config.enabled || document.kind() != DocumentKind::Image {
            return None;
        }

        match self.enhance(&document.data) {
            Ok(bytes) => {
                debug!(
                    "Preprocessed {}: {} -> {} bytes",
                    document.file_name,
                    document.len(),
                    bytes.len()
                );
                Some(Document::new(document.file_name.clone(), "image/png", bytes))
            }
            Err(e) => {
                warn!(
                    "Preprocessing failed for {}, using original: {}",
                    document.file_name, e
                );
                None
            }
        }
    }

    /// Decode, enhance and re-encode as PNG.
    pub fn enhance(&self, bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
        let img = image::load_from_memory(bytes)?;
        let (width, height) = img.dimensions();
        let (target_w, target_h) = target_dimensions(
            width,
            height,
            self.config.max_dimension,
            self.config.min_width,
        );

        let mut processed = img.grayscale();
        if (target_w, target_h) != (width, height) {
            debug!(
                "Resizing image {}x{} -> {}x{}",
                width, height, target_w, target_h
            );
            processed = processed.resize_exact(target_w, target_h, FilterType::Lanczos3);
        }
        let processed: DynamicImage = processed
            .adjust_contrast(self.config.contrast)
            .unsharpen(self.config.sharpen_sigma, self.config.sharpen_threshold);

        let mut out = Cursor::new(Vec::new());
        processed.write_to(&mut out, ImageOutputFormat::Png)?;
        Ok(out.into_inner())
    }
}

/// Upscale narrow images to `min_width`, then cap the longest side at `max_dimension`.
pub fn target_dimensions(width: u32, height: u32, max_dimension: u32, min_width: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }

    let mut scale = 1.0f64;
    if width < min_width {
        scale = min_width as f64 / width as f64;
    }
    let longest = width.max(height) as f64 * scale;
    if max_dimension > 0 && longest > max_dimension as f64 {
        scale *= max_dimension as f64 / longest;
    }

    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}
