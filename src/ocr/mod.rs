//! Modular OCR provider abstraction.
//!
//! Defines the [`OcrProvider`] trait and the unified types every backend
//! (OpenRouter vision, Mistral OCR, native PDF text layer) produces, so the
//! orchestrator can walk them in priority order without knowing which is which.

pub mod mistral;
pub mod native;
pub mod openrouter;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Broad document family, used for capability filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Image,
    Text,
}

/// A document submitted for OCR. Cheap to clone; the bytes are shared.
#[derive(Debug, Clone)]
pub struct Document {
    pub file_name: String,
    pub mime_type: String,
    pub data: Arc<Vec<u8>>,
}

impl Document {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data: Arc::new(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Detect the document kind from mime type, then magic bytes, then extension.
    pub fn kind(&self) -> DocumentKind {
        let mime = self.mime_type.to_ascii_lowercase();
        if mime == "application/pdf" {
            return DocumentKind::Pdf;
        }
        if mime.starts_with("image/") {
            return DocumentKind::Image;
        }
        if mime.starts_with("text/") {
            return DocumentKind::Text;
        }

        if self.data.starts_with(b"%PDF") {
            return DocumentKind::Pdf;
        }
        if image::guess_format(&self.data).is_ok() {
            return DocumentKind::Image;
        }

        let name = self.file_name.to_ascii_lowercase();
        if name.ends_with(".pdf") {
            DocumentKind::Pdf
        } else if [".png", ".jpg", ".jpeg", ".webp", ".gif", ".tif", ".tiff", ".bmp"]
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            DocumentKind::Image
        } else {
            DocumentKind::Text
        }
    }

    /// Mime type to advertise to remote providers, filling in a sensible default.
    pub fn effective_mime(&self) -> String {
        if !self.mime_type.is_empty() && self.mime_type != "application/octet-stream" {
            return self.mime_type.clone();
        }
        match self.kind() {
            DocumentKind::Pdf => "application/pdf".to_string(),
            DocumentKind::Image => match image::guess_format(&self.data) {
                Ok(image::ImageFormat::Jpeg) => "image/jpeg".to_string(),
                Ok(image::ImageFormat::WebP) => "image/webp".to_string(),
                Ok(image::ImageFormat::Gif) => "image/gif".to_string(),
                Ok(image::ImageFormat::Tiff) => "image/tiff".to_string(),
                Ok(image::ImageFormat::Bmp) => "image/bmp".to_string(),
                _ => "image/png".to_string(),
            },
            DocumentKind::Text => "text/plain".to_string(),
        }
    }

    /// Hex SHA-256 of the raw bytes.
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.data.as_slice());
        format!("{:x}", hasher.finalize())
    }

    /// `data:` URL for providers that accept inline base64 payloads.
    pub fn data_url(&self) -> String {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        format!("data:{};base64,{}", self.effective_mime(), BASE64.encode(self.data.as_slice()))
    }
}

/// Metadata attached to a provider result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcrMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Unified OCR result returned by every provider attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    pub success: bool,
    pub text: String,
    pub confidence: f64,
    pub processing_time_ms: u64,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: OcrMetadata,
}

impl OcrResult {
    /// Successful result with provider-reported or heuristic confidence.
    pub fn success(provider: impl Into<String>, text: impl Into<String>, confidence: f64) -> Self {
        Self {
            success: true,
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            processing_time_ms: 0,
            provider: provider.into(),
            structured_data: None,
            error: None,
            metadata: OcrMetadata::default(),
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Errors raised by provider adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} rate limited: {message}")]
    RateLimited { provider: String, message: String },
    #[error("{provider} API error ({status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },
    #[error("{provider} transport error: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} does not support {mime_type} documents")]
    Unsupported { provider: String, mime_type: String },
    #[error("{provider} returned an unusable response: {message}")]
    Malformed { provider: String, message: String },
    #[error("{provider} is not configured: {message}")]
    NotConfigured { provider: String, message: String },
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota",
    "resource_exhausted",
    "resource exhausted",
];

impl ProviderError {
    /// Quota-shaped failure: HTTP 429 or a recognisable rate-limit message.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Http { status: 429, .. } => true,
            Self::Http { body, .. } => mentions_rate_limit(body),
            Self::Transport { message, .. } => mentions_rate_limit(message),
            _ => false,
        }
    }

    /// Worth retrying against the same provider (5xx, network, timeout).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500,
            Self::Timeout { .. } | Self::Transport { .. } => true,
            _ => false,
        }
    }

    /// Build from a non-success HTTP status, classifying 429 as a quota error.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        if status == 429 {
            Self::RateLimited {
                provider: provider.to_string(),
                message: body,
            }
        } else {
            Self::Http {
                provider: provider.to_string(),
                status,
                body,
            }
        }
    }

    pub fn transport(provider: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, document: &Document) -> Result<OcrResult, ProviderError>;

    /// Cheap liveness check used by the providers endpoint.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_detection() {
        let pdf = Document::new("a.bin", "", b"%PDF-1.5 ...".to_vec());
        assert_eq!(pdf.kind(), DocumentKind::Pdf);

        let by_mime = Document::new("scan", "image/jpeg", vec![1, 2, 3]);
        assert_eq!(by_mime.kind(), DocumentKind::Image);

        let by_ext = Document::new("confirmation.PNG", "application/octet-stream", vec![0; 4]);
        assert_eq!(by_ext.kind(), DocumentKind::Image);

        let text = Document::new("notes.txt", "", b"hello".to_vec());
        assert_eq!(text.kind(), DocumentKind::Text);
    }

    #[test]
    fn test_rate_limit_classification() {
        let e = ProviderError::from_status("mistral_ocr", 429, "slow down".to_string());
        assert!(e.is_rate_limited());
        assert!(!e.is_transient());

        let quota = ProviderError::Http {
            provider: "openrouter_vision".to_string(),
            status: 403,
            body: "Quota exceeded for this key".to_string(),
        };
        assert!(quota.is_rate_limited());

        let server = ProviderError::from_status("mistral_ocr", 503, "overloaded".to_string());
        assert!(!server.is_rate_limited());
        assert!(server.is_transient());

        let bad = ProviderError::from_status("mistral_ocr", 400, "bad request".to_string());
        assert!(!bad.is_transient());
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = Document::new("a.pdf", "application/pdf", b"same".to_vec());
        let b = Document::new("b.pdf", "application/pdf", b"same".to_vec());
        assert_eq!(a.content_hash(), b.content_hash());
    }
}
