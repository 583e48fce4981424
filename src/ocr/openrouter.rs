//! OpenRouter vision OCR provider.
//!
//! Sends the document to a vision-capable chat model and asks for a JSON
//! transcription. Models are tried in the configured order; the next model is
//! only used when the current one is unavailable.

use super::{Document, DocumentKind, OcrMetadata, OcrProvider, OcrResult, ProviderError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const OPENROUTER_PROVIDER: &str = "openrouter_vision";

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const OPENROUTER_MODELS_URL: &str = "https://openrouter.ai/api/v1/models";
const DEFAULT_MODELS: &[&str] = &["google/gemini-2.5-pro", "google/gemini-2.5-flash"];

const TRANSCRIBE_PROMPT: &str = r#"You are an OCR engine for accommodation booking documents (confirmations, invoices, vouchers, handwritten notes).

Transcribe ALL visible text exactly as written, preserving line breaks. Do not summarize or translate.
Then report your confidence in the transcription (0.0 to 1.0), the dominant language (ISO 639-1),
and any booking fields you can read verbatim.

Return a JSON object:
{
  "text": "full transcription",
  "confidence": 0.0,
  "language": "en",
  "fields": {
    "guestName": null,
    "checkIn": "YYYY-MM-DD",
    "checkOut": "YYYY-MM-DD",
    "guestCount": null,
    "totalAmount": null,
    "currency": null,
    "platform": null,
    "confirmationCode": null
  }
}"#;

/// OpenRouter client configured for document transcription.
#[derive(Clone)]
pub struct OpenRouterVisionProvider {
    client: Client,
    api_key: String,
    models: Vec<String>,
}

impl OpenRouterVisionProvider {
    /// Create a provider reading the API key from the given env var.
    pub fn from_env(client: Client, key_var: &str, models: &[String]) -> Result<Self, ProviderError> {
        let api_key = std::env::var(key_var).map_err(|_| ProviderError::NotConfigured {
            provider: OPENROUTER_PROVIDER.to_string(),
            message: format!("{} environment variable not set", key_var),
        })?;

        let models = if models.is_empty() {
            DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()
        } else {
            models.to_vec()
        };

        Ok(Self {
            client,
            api_key,
            models,
        })
    }

    /// Transcribe with one specific model.
    async fn transcribe(&self, document: &Document, model: &str) -> Result<OcrResult, ProviderError> {
        let started = Instant::now();
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                Message::system(TRANSCRIBE_PROMPT),
                Message::user_with_document("Transcribe this document.", document),
            ],
            max_tokens: Some(16384),
            response_format: Some(ResponseFormat::JsonObject),
        };

        debug!("Sending request to OpenRouter: model={}", request.model);

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::transport(OPENROUTER_PROVIDER, e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                OPENROUTER_PROVIDER,
                status.as_u16(),
                error_text,
            ));
        }

        let response: ChatCompletionResponse = response.json().await.map_err(|e| {
            ProviderError::Malformed {
                provider: OPENROUTER_PROVIDER.to_string(),
                message: format!("Failed to parse OpenRouter response: {}", e),
            }
        })?;

        if let Some(usage) = &response.usage {
            info!(
                "OpenRouter response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let transcription = parse_transcription(&content)?;
        let mut result = OcrResult::success(
            OPENROUTER_PROVIDER,
            transcription.text,
            transcription.confidence.unwrap_or(0.85),
        );
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        result.structured_data = transcription.fields.filter(|f| f.is_object());
        result.metadata = OcrMetadata {
            language: transcription.language,
            model: Some(model.to_string()),
            ..OcrMetadata::default()
        };
        Ok(result)
    }
}

#[async_trait::async_trait]
impl OcrProvider for OpenRouterVisionProvider {
    fn name(&self) -> &str {
        OPENROUTER_PROVIDER
    }

    async fn process(&self, document: &Document) -> Result<OcrResult, ProviderError> {
        if document.kind() == DocumentKind::Text {
            return Err(ProviderError::Unsupported {
                provider: OPENROUTER_PROVIDER.to_string(),
                mime_type: document.effective_mime(),
            });
        }

        let mut last_error = None;
        for model in &self.models {
            match self.transcribe(document, model).await {
                Ok(result) => return Ok(result),
                Err(e) if model_unavailable(&e) => {
                    warn!("OpenRouter model {} unavailable, trying next: {}", model, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::NotConfigured {
            provider: OPENROUTER_PROVIDER.to_string(),
            message: "no models configured".to_string(),
        }))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(OPENROUTER_MODELS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::transport(OPENROUTER_PROVIDER, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(OPENROUTER_PROVIDER, status, body));
        }
        Ok(())
    }
}

/// Errors where a different model may still succeed.
fn model_unavailable(error: &ProviderError) -> bool {
    matches!(
        error,
        ProviderError::Http {
            status: 404 | 503,
            ..
        }
    )
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    fields: Option<serde_json::Value>,
}

/// Parse the model output, tolerating markdown fences around the JSON.
fn parse_transcription(content: &str) -> Result<Transcription, ProviderError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    match serde_json::from_str::<Transcription>(json) {
        Ok(t) => Ok(t),
        // Some models ignore the response format and answer in plain text.
        Err(_) if !json.is_empty() && !json.starts_with('{') => Ok(Transcription {
            text: json.to_string(),
            confidence: None,
            language: None,
            fields: None,
        }),
        Err(e) => Err(ProviderError::Malformed {
            provider: OPENROUTER_PROVIDER.to_string(),
            message: format!("Failed to parse transcription JSON: {}", e),
        }),
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseFormat {
    JsonObject,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: Role,
    content: MessageContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Clone, Serialize)]
struct FileData {
    filename: String,
    file_data: String,
}

impl Message {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    /// User message carrying the document inline: images as image parts,
    /// PDFs as file parts.
    fn user_with_document(text: impl Into<String>, document: &Document) -> Self {
        let attachment = match document.kind() {
            DocumentKind::Pdf => ContentPart::File {
                file: FileData {
                    filename: document.file_name.clone(),
                    file_data: document.data_url(),
                },
            },
            _ => ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: document.data_url(),
                },
            },
        };

        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Text { text: text.into() }, attachment]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_transcription() {
        let content = "```json\n{\"text\": \"Check-in: 2024-05-01\", \"confidence\": 0.93, \"language\": \"en\", \"fields\": {\"checkIn\": \"2024-05-01\"}}\n```";
        let t = parse_transcription(content).unwrap();
        assert_eq!(t.text, "Check-in: 2024-05-01");
        assert_eq!(t.confidence, Some(0.93));
        assert_eq!(t.fields.unwrap()["checkIn"], "2024-05-01");
    }

    #[test]
    fn test_plain_text_fallback() {
        let t = parse_transcription("Guest: Ana Costa").unwrap();
        assert_eq!(t.text, "Guest: Ana Costa");
        assert!(t.confidence.is_none());
    }

    #[test]
    fn test_broken_json_is_malformed() {
        assert!(matches!(
            parse_transcription("{\"text\": "),
            Err(ProviderError::Malformed { .. })
        ));
    }

    #[test]
    fn test_pdf_sent_as_file_part() {
        let doc = Document::new("b.pdf", "application/pdf", b"%PDF-1.4".to_vec());
        let msg = Message::user_with_document("go", &doc);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][1]["type"], "file");
        assert_eq!(json["content"][1]["file"]["filename"], "b.pdf");
        assert!(json["content"][1]["file"]["file_data"]
            .as_str()
            .unwrap()
            .starts_with("data:application/pdf;base64,"));
    }

    #[test]
    fn test_model_fallback_only_on_unavailable() {
        let gone = ProviderError::from_status(OPENROUTER_PROVIDER, 404, "no such model".into());
        let bad = ProviderError::from_status(OPENROUTER_PROVIDER, 400, "bad".into());
        assert!(model_unavailable(&gone));
        assert!(!model_unavailable(&bad));
    }
}
