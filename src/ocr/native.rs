//! Native PDF text-layer provider (no AI, no network).

use super::{Document, DocumentKind, OcrMetadata, OcrProvider, OcrResult, ProviderError};
use tokio::time::Instant;
use tracing::debug;

pub const NATIVE_PROVIDER: &str = "native_pdf";

/// Below this many characters the text layer is considered absent (scanned PDF).
const USABLE_TEXT_CHARS: usize = 50;

pub struct NativePdfProvider;

impl NativePdfProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativePdfProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl OcrProvider for NativePdfProvider {
    fn name(&self) -> &str {
        NATIVE_PROVIDER
    }

    async fn process(&self, document: &Document) -> Result<OcrResult, ProviderError> {
        let started = Instant::now();

        let (text, page_count) = match document.kind() {
            DocumentKind::Pdf => {
                let data = document.data.clone();
                tokio::task::spawn_blocking(move || extract_pdf_text(&data))
                    .await
                    .map_err(|e| ProviderError::transport(NATIVE_PROVIDER, e))??
            }
            DocumentKind::Text => (String::from_utf8_lossy(&document.data).to_string(), 1),
            DocumentKind::Image => {
                return Err(ProviderError::Unsupported {
                    provider: NATIVE_PROVIDER.to_string(),
                    mime_type: document.effective_mime(),
                })
            }
        };

        let chars = text.trim().chars().count();
        let confidence = if chars >= USABLE_TEXT_CHARS { 0.9 } else { 0.3 };
        debug!(
            "NativePdfProvider: {} pages, {} chars from {}",
            page_count, chars, document.file_name
        );

        let mut result = OcrResult::success(NATIVE_PROVIDER, text, confidence);
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        result.metadata = OcrMetadata {
            page_count: Some(page_count),
            ..OcrMetadata::default()
        };
        Ok(result)
    }
}

/// Extract the text layer of a PDF using lopdf. Returns text and page count.
pub fn extract_pdf_text(data: &[u8]) -> Result<(String, u32), ProviderError> {
    use lopdf::Document as PdfDocument;
    use std::io::Cursor;

    let doc = PdfDocument::load_from(Cursor::new(data)).map_err(|e| ProviderError::Malformed {
        provider: NATIVE_PROVIDER.to_string(),
        message: format!("Failed to load PDF: {}", e),
    })?;

    let mut text = String::new();
    let pages = doc.get_pages();
    let page_count = pages.len() as u32;

    for (page_num, _) in pages {
        if let Ok(content) = doc.extract_text(&[page_num]) {
            text.push_str(&content);
            text.push('\n');
        }
    }

    Ok((text, page_count))
}

/// Page count without extracting text. `None` when the PDF cannot be parsed.
pub fn pdf_page_count(data: &[u8]) -> Option<u32> {
    lopdf::Document::load_from(std::io::Cursor::new(data))
        .ok()
        .map(|doc| doc.get_pages().len() as u32)
}

/// Build a single-page PDF with one text line per entry. Test fixture helper.
#[cfg(test)]
pub fn fixture_pdf(lines: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};

    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut operations = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), 12.into()]));
        operations.push(Operation::new(
            "Td",
            vec![72.into(), (720 - 18 * i as i64).into()],
        ));
        operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
        operations.push(Operation::new("ET", vec![]));
    }
    let content = Content { operations };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content.encode().expect("encode content"),
    ));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).expect("save pdf");
    out
}
