//! Mistral OCR provider (uses Mistral's OCR API).

use super::{Document, DocumentKind, OcrMetadata, OcrProvider, OcrResult, ProviderError};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

pub const MISTRAL_PROVIDER: &str = "mistral_ocr";

const MISTRAL_API_BASE: &str = "https://api.mistral.ai/v1";
const DEFAULT_MODEL: &str = "mistral-ocr-latest";
const PAGE_SEPARATOR: &str = "\n\n---\n\n";

pub struct MistralOcrProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl MistralOcrProvider {
    pub fn from_env(client: reqwest::Client, key_var: &str, models: &[String]) -> Result<Self, ProviderError> {
        let api_key = std::env::var(key_var).map_err(|_| ProviderError::NotConfigured {
            provider: MISTRAL_PROVIDER.to_string(),
            message: format!("{} not set", key_var),
        })?;
        let model = models
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Self {
            api_key,
            model,
            client,
        })
    }
}

// ── Mistral API request/response types ──────────────────────────────────────

#[derive(Serialize)]
struct OcrRequest {
    model: String,
    document: DocumentSource,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum DocumentSource {
    #[serde(rename = "image_url")]
    Image { image_url: String },
    #[serde(rename = "file")]
    File { file_id: String },
}

#[derive(Deserialize)]
struct OcrResponse {
    pages: Vec<MistralPage>,
}

#[derive(Deserialize)]
struct MistralPage {
    #[allow(dead_code)]
    index: u32,
    markdown: String,
}

#[derive(Deserialize)]
struct FileUploadResponse {
    id: String,
}

// ── Provider implementation ─────────────────────────────────────────────────

#[async_trait::async_trait]
impl OcrProvider for MistralOcrProvider {
    fn name(&self) -> &str {
        MISTRAL_PROVIDER
    }

    async fn process(&self, document: &Document) -> Result<OcrResult, ProviderError> {
        let started = Instant::now();
        let source = match document.kind() {
            DocumentKind::Pdf => {
                let file_id = self.upload_file(document).await?;
                DocumentSource::File { file_id }
            }
            DocumentKind::Image => DocumentSource::Image {
                image_url: document.data_url(),
            },
            DocumentKind::Text => {
                return Err(ProviderError::Unsupported {
                    provider: MISTRAL_PROVIDER.to_string(),
                    mime_type: document.effective_mime(),
                })
            }
        };

        let body = OcrRequest {
            model: self.model.clone(),
            document: source,
        };

        info!("MistralOcrProvider: calling OCR API for {}", document.file_name);

        let resp = self
            .client
            .post(format!("{}/ocr", MISTRAL_API_BASE))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(MISTRAL_PROVIDER, e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(MISTRAL_PROVIDER, status, text));
        }

        let raw_text = resp
            .text()
            .await
            .map_err(|e| ProviderError::transport(MISTRAL_PROVIDER, e))?;
        debug!(
            "MistralOcrProvider: raw response ({} bytes): {}",
            raw_text.len(),
            &raw_text[..floor_char_boundary(&raw_text, 500)]
        );
        let ocr: OcrResponse = serde_json::from_str(&raw_text).map_err(|e| ProviderError::Malformed {
            provider: MISTRAL_PROVIDER.to_string(),
            message: e.to_string(),
        })?;

        let total_pages = ocr.pages.len() as u32;
        let text = ocr
            .pages
            .iter()
            .map(|p| p.markdown.as_str())
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR);

        let mut result = OcrResult::success(MISTRAL_PROVIDER, text, heuristic_confidence(&ocr.pages));
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        result.metadata = OcrMetadata {
            page_count: Some(total_pages),
            model: Some(self.model.clone()),
            ..OcrMetadata::default()
        };
        Ok(result)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let resp = self
            .client
            .get(format!("{}/models", MISTRAL_API_BASE))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::transport(MISTRAL_PROVIDER, e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(MISTRAL_PROVIDER, status, text));
        }
        Ok(())
    }
}

impl MistralOcrProvider {
    /// Upload raw bytes to Mistral Files API, return the file_id.
    async fn upload_file(&self, document: &Document) -> Result<String, ProviderError> {
        use reqwest::multipart::{Form, Part};

        info!(
            "MistralOcrProvider: uploading {} ({} bytes) to Files API",
            document.file_name,
            document.len()
        );

        let part = Part::bytes(document.data.to_vec())
            .file_name(document.file_name.clone())
            .mime_str("application/pdf")
            .map_err(|e| ProviderError::transport(MISTRAL_PROVIDER, e))?;

        let form = Form::new().part("file", part).text("purpose", "ocr");

        let resp = self
            .client
            .post(format!("{}/files", MISTRAL_API_BASE))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::transport(MISTRAL_PROVIDER, e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(MISTRAL_PROVIDER, status, text));
        }

        let upload: FileUploadResponse = resp.json().await.map_err(|e| ProviderError::Malformed {
            provider: MISTRAL_PROVIDER.to_string(),
            message: e.to_string(),
        })?;
        info!("MistralOcrProvider: uploaded file_id={}", upload.id);
        Ok(upload.id)
    }
}

/// Mistral reports no confidence; derive one from how many pages came back empty.
fn heuristic_confidence(pages: &[MistralPage]) -> f64 {
    if pages.is_empty() {
        return 0.0;
    }
    let non_empty = pages.iter().filter(|p| !p.markdown.trim().is_empty()).count();
    0.92 * non_empty as f64 / pages.len() as f64
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
