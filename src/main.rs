//! Booking OCR - multi-provider OCR orchestration server.

mod batch;
mod config;
mod handwriting;
mod hints;
mod limiter;
mod ocr;
mod orchestrator;
mod preprocess;
mod quality;
mod registry;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use batch::BatchCoordinator;
use config::ServiceConfig;
use ocr::{Document, OcrMetadata};
use orchestrator::{AttemptRecord, Disposition, OcrError, OcrOrchestrator, ProcessOptions, ProcessOutcome};
use registry::{credential_present, ProviderRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<OcrOrchestrator>,
    batch: BatchCoordinator,
    config: Arc<ServiceConfig>,
    /// Cancelled on shutdown; every request works under a child token.
    shutdown: CancellationToken,
}

impl AppState {
    fn new(config: ServiceConfig, orchestrator: OcrOrchestrator) -> Self {
        let orchestrator = Arc::new(orchestrator);
        Self {
            batch: BatchCoordinator::new(Arc::clone(&orchestrator)),
            orchestrator,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "booking_ocr=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::load()?;

    // Fail fast when no provider can serve a request
    let registry = Arc::new(ProviderRegistry::from_config(&config));
    registry.ensure_usable()?;
    info!(
        "Providers available: {:?}",
        registry.list_available().iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
    );

    let orchestrator = OcrOrchestrator::from_config(&config, registry)?;
    let state = AppState::new(config.clone(), orchestrator);
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down, cancelling in-flight OCR work");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let single = upload_limit(state.config.max_file_size_bytes());
    let batch = single.saturating_mul(state.config.max_batch_size.max(1));

    Router::new()
        .route("/health", get(health))
        .route(
            "/ocr/process",
            post(process_document).layer(DefaultBodyLimit::max(single)),
        )
        .route(
            "/ocr/batch",
            post(batch_documents).layer(DefaultBodyLimit::max(batch)),
        )
        .route("/ocr/providers", get(list_providers))
        .route("/ocr/providers/reload", post(reload_providers))
        .route("/ocr/status", get(status))
        .route("/ocr/validate", post(validate_text))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Room for base64 inflation plus form overhead, so oversized files reach
/// the size check and get a proper 413.
fn upload_limit(file_bytes: usize) -> usize {
    file_bytes / 3 * 4 + 1024 * 1024
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePayload {
    file_base64: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

impl FilePayload {
    fn into_document(self) -> Result<Document, ApiError> {
        // Accept bare base64 or a data URL.
        let encoded = match self.file_base64.split_once(";base64,") {
            Some((_, data)) => data,
            None => self.file_base64.as_str(),
        };
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| ApiError::bad_request(format!("Invalid fileBase64: {}", e)))?;
        Ok(Document::new(
            self.file_name.unwrap_or_else(|| "document".to_string()),
            self.mime_type.unwrap_or_default(),
            data,
        ))
    }
}

/// Options accepted as JSON fields or multipart text fields.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadOptions {
    preferred_provider: Option<String>,
    require_high_quality: Option<bool>,
    /// Deadline in milliseconds.
    timeout: Option<u64>,
    document_type: Option<String>,
    concurrency: Option<usize>,
}

impl UploadOptions {
    fn set(&mut self, field: &str, value: &str) -> Result<(), ApiError> {
        match field {
            "preferredProvider" => self.preferred_provider = Some(value.to_string()),
            "documentType" => self.document_type = Some(value.to_string()),
            "requireHighQuality" => {
                self.require_high_quality = Some(matches!(value, "true" | "1" | "yes"))
            }
            "timeout" => self.timeout = Some(value.parse::<u64>().map_err(|e| invalid(field, e))?),
            "concurrency" => self.concurrency = Some(value.parse::<usize>().map_err(|e| invalid(field, e))?),
            _ => {}
        }
        Ok(())
    }

    fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            preferred_provider: self.preferred_provider.clone(),
            require_high_quality: self.require_high_quality.unwrap_or(false),
            deadline: self.timeout.filter(|ms| *ms > 0).map(Duration::from_millis),
            document_type: self.document_type.clone(),
        }
    }
}

fn invalid(field: &str, err: impl std::fmt::Display) -> ApiError {
    ApiError::bad_request(format!("Invalid {}: {}", field, err))
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    #[serde(flatten)]
    file: FilePayload,
    #[serde(flatten)]
    options: UploadOptions,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    documents: Vec<FilePayload>,
    #[serde(flatten)]
    options: UploadOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessResponse {
    success: bool,
    provider: String,
    confidence: f64,
    processing_time: u64,
    text: String,
    structured_data: Option<Value>,
    missing_fields: Vec<String>,
    metadata: ResponseMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseMetadata {
    #[serde(flatten)]
    ocr: OcrMetadata,
    request_id: String,
    disposition: Disposition,
    quality_score: u8,
    issues: Vec<String>,
    corrections: Vec<String>,
    handwriting_score: f32,
    preprocessed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_type: Option<String>,
    attempts: Vec<AttemptRecord>,
}

impl ProcessResponse {
    fn new(outcome: ProcessOutcome, processing_time: u64) -> Self {
        let ProcessOutcome {
            request_id,
            result,
            validation,
            disposition,
            missing_fields,
            handwriting_score,
            preprocessed,
            document_type,
            attempts,
        } = outcome;
        Self {
            success: true,
            provider: result.provider,
            confidence: result.confidence,
            processing_time,
            text: result.text,
            structured_data: result.structured_data,
            missing_fields,
            metadata: ResponseMetadata {
                ocr: result.metadata,
                request_id,
                disposition,
                quality_score: validation.quality_score,
                issues: validation.issues,
                corrections: validation.corrections,
                handwriting_score,
                preprocessed,
                document_type,
                attempts,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    text: String,
    /// Without a provider there is no confidence to penalise.
    #[serde(default = "full_confidence")]
    confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

/// Error body: `{success: false, error, provider?}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    provider: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            provider: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// From an axum body rejection, keeping its status (413 for oversized bodies).
    fn rejected(status: StatusCode, message: impl std::fmt::Display) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            Self::new(status, "File too large")
        } else {
            Self::new(status, message.to_string())
        }
    }
}

impl From<OcrError> for ApiError {
    fn from(err: OcrError) -> Self {
        let status = match &err {
            OcrError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            OcrError::EmptyDocument => StatusCode::BAD_REQUEST,
            OcrError::NoProviders | OcrError::Misconfigured(_) | OcrError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OcrError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            OcrError::Exhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            provider: err.last_provider().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{} {}", self.status, self.message);
        } else {
            warn!("{} {}", self.status, self.message);
        }
        let mut body = json!({ "success": false, "error": self.message });
        if let Some(provider) = self.provider {
            body["provider"] = json!(provider);
        }
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// OCR one document, uploaded as multipart `file` or JSON `fileBase64`.
async fn process_document(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<ProcessResponse>, ApiError> {
    let started = Instant::now();
    let (documents, options) = if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?;
        read_multipart(multipart).await?
    } else {
        let Json(body) = Json::<ProcessRequest>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?;
        (vec![body.file.into_document()?], body.options)
    };

    let document = documents
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::bad_request("No file uploaded"))?;
    info!(
        "Received file: {} ({} bytes, {})",
        document.file_name,
        document.len(),
        document.effective_mime()
    );

    let cancel = state.shutdown.child_token();
    let outcome = state
        .orchestrator
        .process(document, &options.process_options(), &cancel)
        .await?;

    let elapsed = started.elapsed().as_millis() as u64;
    Ok(Json(ProcessResponse::new(outcome, elapsed)))
}

/// OCR up to `maxBatchSize` documents; results come back in input order.
async fn batch_documents(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let (documents, options) = if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?;
        read_multipart(multipart).await?
    } else {
        let Json(body) = Json::<BatchRequest>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?;
        let documents = body
            .documents
            .into_iter()
            .map(FilePayload::into_document)
            .collect::<Result<Vec<_>, _>>()?;
        (documents, body.options)
    };

    let max = state.config.max_batch_size;
    if documents.is_empty() {
        return Err(ApiError::bad_request("No documents provided"));
    }
    if documents.len() > max {
        return Err(ApiError::bad_request(format!(
            "Batch of {} documents exceeds the maximum of {}",
            documents.len(),
            max
        )));
    }

    let concurrency = options
        .concurrency
        .unwrap_or(state.config.default_batch_concurrency)
        .clamp(1, max.max(1));
    info!("Batch of {} documents, concurrency {}", documents.len(), concurrency);

    let cancel = state.shutdown.child_token();
    let report = state
        .batch
        .batch_process(documents, concurrency, &options.process_options(), &cancel)
        .await;

    let results: Vec<Value> = report
        .results
        .into_iter()
        .enumerate()
        .map(|(index, result)| match result {
            Ok(outcome) => {
                let elapsed = outcome.result.processing_time_ms;
                let mut value =
                    serde_json::to_value(ProcessResponse::new(outcome, elapsed)).unwrap_or(Value::Null);
                value["index"] = json!(index);
                value
            }
            Err(e) => {
                let mut value = json!({ "index": index, "success": false, "error": e.to_string() });
                if let Some(provider) = e.last_provider() {
                    value["provider"] = json!(provider);
                }
                value
            }
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "summary": report.summary,
        "results": results,
    })))
}

/// Registry status, live health checks and configuration diagnostics.
async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let registry = state.orchestrator.registry();
    let health = state.orchestrator.health().await;
    Json(json!({
        "success": true,
        "providers": registry.all(),
        "available": registry.list_available().len(),
        "health": health,
        "diagnostics": registry.validate(),
    }))
}

/// Re-read configuration and credentials. Adapters are built at startup, so
/// a provider whose credentials first appear here needs a restart to be used.
async fn reload_providers(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let config = ServiceConfig::load()
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    let registry = state.orchestrator.registry();
    registry.reload(&config, credential_present);
    Ok(Json(json!({
        "success": true,
        "providers": registry.all(),
        "diagnostics": registry.validate(),
    })))
}

/// Lightweight liveness and queue statistics.
async fn status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.orchestrator.stats();
    Json(json!({
        "success": true,
        "status": "ok",
        "availableProviders": state.orchestrator.registry().list_available().len(),
        "stats": stats,
    }))
}

/// Run the quality gate on caller-supplied text without calling any provider.
async fn validate_text(
    State(state): State<AppState>,
    payload: Result<Json<ValidateRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::rejected(e.status(), e.body_text()))?;
    let validator = state.orchestrator.validator();
    let validation = validator.validate_text(&body.text, body.confidence);
    Ok(Json(json!({
        "success": true,
        "validation": validation,
        "qualityTier": validator.quality_tier(body.confidence),
        "domainIndicators": validator.domain_indicators(&body.text),
    })))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// Collect `file`/`files` parts as documents and text parts as options.
async fn read_multipart(mut multipart: Multipart) -> Result<(Vec<Document>, UploadOptions), ApiError> {
    let mut documents = Vec::new();
    let mut options = UploadOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::rejected(e.status(), format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" || name == "files" {
            let file_name = field.file_name().unwrap_or("document").to_string();
            let mime_type = field.content_type().unwrap_or_default().to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::rejected(e.status(), format!("Failed to read file: {}", e)))?;
            documents.push(Document::new(file_name, mime_type, data.to_vec()));
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::rejected(e.status(), format!("Failed to read {}: {}", name, e)))?;
            options.set(&name, value.trim())?;
        }
    }

    Ok((documents, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::ProviderError;
    use crate::orchestrator::tests::{orchestrator_with, settings, text, ScriptedProvider, BOOKING_TEXT};
    use axum::body::Body;
    use tower::ServiceExt;

    fn app(config: ServiceConfig, adapters: &[Arc<ScriptedProvider>]) -> Router {
        let orchestrator = orchestrator_with(&config, adapters);
        router(AppState::new(config, orchestrator))
    }

    fn one_provider() -> ServiceConfig {
        ServiceConfig {
            providers: vec![settings("p1", 1)],
            ..ServiceConfig::default()
        }
    }

    async fn send(app: Router, request: Request) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)));
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let request = axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app(one_provider(), &[]), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("ok"));
    }

    #[tokio::test]
    async fn test_process_json_upload() {
        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.95)]);
        let request = post_json(
            "/ocr/process",
            json!({
                "fileBase64": BASE64.encode("scanned booking"),
                "mimeType": "text/plain",
                "fileName": "booking.txt",
                "documentType": "confirmation",
            }),
        );
        let (status, body) = send(app(one_provider(), &[p1]), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["provider"], "p1");
        assert_eq!(body["text"], BOOKING_TEXT);
        assert_eq!(body["structuredData"]["checkOut"], "2024-05-05");
        assert_eq!(body["missingFields"], json!([]));
        assert_eq!(body["metadata"]["disposition"], "accepted");
        assert_eq!(body["metadata"]["quality"], "good");
        assert_eq!(body["metadata"]["documentType"], "confirmation");
        assert_eq!(body["metadata"]["attempts"][0]["outcome"], "accepted");
    }

    #[tokio::test]
    async fn test_process_multipart_upload() {
        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.95)]);
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"booking.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nscanned booking\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"requireHighQuality\"\r\n\r\ntrue\r\n\
             --{b}--\r\n",
            b = boundary
        );
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/ocr/process")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={}", boundary))
            .body(Body::from(body))
            .unwrap();

        let (status, body) = send(app(one_provider(), &[p1]), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"], "p1");
    }

    #[tokio::test]
    async fn test_oversized_file_is_413() {
        let config = ServiceConfig {
            max_file_size_mb: 1,
            ..one_provider()
        };
        let request = post_json(
            "/ocr/process",
            json!({ "fileBase64": BASE64.encode(vec![b'a'; 1_500_000]), "mimeType": "text/plain" }),
        );
        let (status, body) = send(app(config, &[]), request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_bad_base64_is_400() {
        let request = post_json("/ocr/process", json!({ "fileBase64": "***" }));
        let (status, body) = send(app(one_provider(), &[]), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("fileBase64"));
    }

    #[tokio::test]
    async fn test_exhaustion_is_500_with_provider() {
        let p1 = ScriptedProvider::new(
            "p1",
            vec![Err(ProviderError::from_status("p1", 400, "bad".to_string()))],
        );
        let request = post_json(
            "/ocr/process",
            json!({ "fileBase64": BASE64.encode("doc"), "mimeType": "text/plain" }),
        );
        let (status, body) = send(app(one_provider(), &[p1]), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["provider"], "p1");
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_summarises() {
        let p1 = ScriptedProvider::new(
            "p1",
            vec![
                text("p1", BOOKING_TEXT, 0.95),
                Err(ProviderError::from_status("p1", 400, "bad".to_string())),
            ],
        );
        let request = post_json(
            "/ocr/batch",
            json!({
                "documents": [
                    { "fileBase64": BASE64.encode("first"), "mimeType": "text/plain" },
                    { "fileBase64": BASE64.encode("second"), "mimeType": "text/plain" },
                ],
                "concurrency": 1,
            }),
        );
        let (status, body) = send(app(one_provider(), &[p1]), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["total"], 2);
        assert_eq!(body["summary"]["successful"], 1);
        assert_eq!(body["summary"]["failed"], 1);
        assert_eq!(body["results"][0]["index"], 0);
        assert_eq!(body["results"][0]["success"], true);
        assert_eq!(body["results"][1]["index"], 1);
        assert_eq!(body["results"][1]["success"], false);
    }

    #[tokio::test]
    async fn test_batch_too_large_is_400() {
        let config = ServiceConfig {
            max_batch_size: 2,
            ..one_provider()
        };
        let doc = json!({ "fileBase64": BASE64.encode("x"), "mimeType": "text/plain" });
        let request = post_json("/ocr/batch", json!({ "documents": [doc.clone(), doc.clone(), doc] }));
        let (status, _) = send(app(config, &[]), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_validate_without_provider() {
        let request = post_json(
            "/ocr/validate",
            json!({ "text": "Check-in: 2024-05-01\nCheck-out: 2024-05-05\nGuest: Maria Santos", "confidence": 0.9 }),
        );
        let (status, body) = send(app(one_provider(), &[]), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["validation"]["isValid"], true);
        assert_eq!(body["qualityTier"], "good");
        assert!(body["domainIndicators"].as_array().unwrap().contains(&json!("checkIn")));
    }

    #[tokio::test]
    async fn test_status_and_providers() {
        let p1 = ScriptedProvider::new("p1", vec![]);
        let router = app(one_provider(), &[p1]);

        let request = axum::http::Request::builder().uri("/ocr/status").body(Body::empty()).unwrap();
        let (status, body) = send(router.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["maxConcurrentRequests"], 5);
        assert_eq!(body["availableProviders"], 1);

        let request = axum::http::Request::builder().uri("/ocr/providers").body(Body::empty()).unwrap();
        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["providers"][0]["name"], "p1");
        assert_eq!(body["health"][0]["healthy"], true);
        assert!(body["diagnostics"].is_array());
    }
}
