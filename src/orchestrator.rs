//! Failover orchestration across OCR providers.
//!
//! Per document: pick providers in priority order (caller preference and the
//! handwriting score can move some to the front), run each attempt through
//! that provider's [`RateLimiter`] under its timeout, retry transient errors,
//! then let the quality gate decide between accepting, accepting degraded
//! text, or moving on. When every provider has been tried the best result
//! seen is returned instead of an error, if there is one.

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ProviderKind, ServiceConfig};
use crate::handwriting::HandwritingDetector;
use crate::hints::{BookingHints, HintExtractor};
use crate::limiter::backoff::BackoffPolicy;
use crate::limiter::cache::cache_key;
use crate::limiter::{LimiterError, LimiterSettings, LimiterStats, RateLimiter};
use crate::ocr::mistral::MistralOcrProvider;
use crate::ocr::native::{pdf_page_count, NativePdfProvider};
use crate::ocr::openrouter::OpenRouterVisionProvider;
use crate::ocr::{Document, DocumentKind, OcrProvider, OcrResult, ProviderError};
use crate::preprocess::Preprocessor;
use crate::quality::{QualityValidator, ValidationResult};
use crate::registry::{ProviderDescriptor, ProviderRegistry};

const MB: u64 = 1024 * 1024;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Why one provider could not deliver.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("no OCR providers are available")]
    NoProviders,
    #[error("provider configuration is invalid: {}", .0.join("; "))]
    Misconfigured(Vec<String>),
    #[error("document is empty")]
    EmptyDocument,
    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("request cancelled")]
    Cancelled,
    #[error("processing deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),
    #[error("all OCR providers failed: {}", describe_failures(.failures))]
    Exhausted { failures: Vec<ProviderFailure> },
}

impl OcrError {
    /// Provider of the last failed attempt, for error responses.
    pub fn last_provider(&self) -> Option<&str> {
        match self {
            Self::Exhausted { failures } => failures.last().map(|f| f.provider.as_str()),
            _ => None,
        }
    }
}

fn describe_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Caller options for one document.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub preferred_provider: Option<String>,
    /// Disables degraded acceptance; only results passing the gate are taken early.
    pub require_high_quality: bool,
    pub deadline: Option<Duration>,
    pub document_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Accepted,
    Degraded,
    Rejected,
    Error,
}

/// One provider attempt, for the audit trail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub provider: String,
    pub attempt: u32,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
    /// Passed the quality gate.
    Accepted,
    /// Failed the gate but had usable text and high quality was not required.
    Degraded,
    /// Every provider was tried; this is the highest-confidence text seen.
    BestEffort,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub request_id: String,
    pub result: OcrResult,
    pub validation: ValidationResult,
    pub disposition: Disposition,
    pub missing_fields: Vec<String>,
    pub handwriting_score: f32,
    pub preprocessed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub name: String,
    pub priority: u32,
    pub available: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub max_concurrent_requests: usize,
    pub available_permits: usize,
    pub queue_length: usize,
    pub processed: u64,
    pub accepted: u64,
    pub degraded: u64,
    pub best_effort: u64,
    pub failed: u64,
    pub providers: Vec<LimiterStats>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    accepted: AtomicU64,
    degraded: AtomicU64,
    best_effort: AtomicU64,
    failed: AtomicU64,
}

/// Document after the cheap local passes.
struct Analysis {
    document: Document,
    preprocessed: bool,
    handwriting_score: f32,
    page_count: Option<u32>,
}

enum Verdict {
    Accepted(OcrResult, ValidationResult, Disposition),
    Rejected(OcrResult, ValidationResult),
    Failed(String),
}

pub struct OcrOrchestrator {
    registry: Arc<ProviderRegistry>,
    providers: HashMap<String, Arc<dyn OcrProvider>>,
    limiters: Mutex<HashMap<String, RateLimiter<OcrResult>>>,
    validator: QualityValidator,
    handwriting: HandwritingDetector,
    preprocessor: Preprocessor,
    hints: HintExtractor,
    permits: Semaphore,
    max_concurrent_requests: usize,
    max_file_size_bytes: usize,
    queue_max_size: usize,
    cache_capacity: usize,
    cache_ttl: Duration,
    counters: Counters,
}

impl OcrOrchestrator {
    /// Orchestrator with no adapters; add them with [`with_provider`](Self::with_provider).
    pub fn new(config: &ServiceConfig, registry: Arc<ProviderRegistry>) -> Self {
        let max_concurrent_requests = config.max_concurrent_requests.max(1);
        Self {
            registry,
            providers: HashMap::new(),
            limiters: Mutex::new(HashMap::new()),
            validator: QualityValidator::new(config.quality.clone()),
            handwriting: HandwritingDetector::new(config.handwriting_threshold),
            preprocessor: Preprocessor::new(config.preprocess.clone()),
            hints: HintExtractor::new(),
            permits: Semaphore::new(max_concurrent_requests),
            max_concurrent_requests,
            max_file_size_bytes: config.max_file_size_bytes(),
            queue_max_size: config.queue_max_size,
            cache_capacity: config.cache.capacity,
            cache_ttl: config.cache.ttl(),
            counters: Counters::default(),
        }
    }

    /// Register the adapter backing the descriptor called `name`.
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn OcrProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Build adapters for every available provider in the registry.
    pub fn from_config(config: &ServiceConfig, registry: Arc<ProviderRegistry>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;

        let mut orchestrator = Self::new(config, Arc::clone(&registry));
        for descriptor in registry.list_available() {
            let key_var = descriptor.credential_env.as_deref().unwrap_or_default();
            let built: Result<Arc<dyn OcrProvider>, ProviderError> = match descriptor.kind {
                ProviderKind::OpenrouterVision => {
                    OpenRouterVisionProvider::from_env(client.clone(), key_var, &descriptor.models)
                        .map(|p| Arc::new(p) as Arc<dyn OcrProvider>)
                }
                ProviderKind::MistralOcr => {
                    MistralOcrProvider::from_env(client.clone(), key_var, &descriptor.models)
                        .map(|p| Arc::new(p) as Arc<dyn OcrProvider>)
                }
                ProviderKind::NativePdf => Ok(Arc::new(NativePdfProvider::new())),
            };
            match built {
                Ok(provider) => {
                    info!(
                        "Provider {} ready (priority {}, {} rpm)",
                        provider.name(),
                        descriptor.priority,
                        descriptor.rate_limit.requests_per_minute
                    );
                    orchestrator = orchestrator.with_provider(descriptor.name.clone(), provider);
                }
                Err(e) => warn!("Skipping provider {}: {}", descriptor.name, e),
            }
        }
        Ok(orchestrator)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn validator(&self) -> &QualityValidator {
        &self.validator
    }

    /// Turn one document into text, failing over between providers.
    pub async fn process(
        &self,
        document: Document,
        options: &ProcessOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, OcrError> {
        if document.is_empty() {
            return Err(OcrError::EmptyDocument);
        }
        if document.len() > self.max_file_size_bytes {
            return Err(OcrError::TooLarge {
                size: document.len(),
                limit: self.max_file_size_bytes,
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let token = cancel.child_token();
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let work = self.run(&request_id, document, options, &token);
        let outcome = match options.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    token.cancel();
                    warn!("[{}] deadline of {:?} exceeded", request_id, deadline);
                    Err(OcrError::DeadlineExceeded(deadline))
                }
            },
            None => work.await,
        };

        if outcome.is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    async fn run(
        &self,
        request_id: &str,
        document: Document,
        options: &ProcessOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, OcrError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OcrError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| OcrError::Cancelled)?,
        };

        let analysis = self.analyse(document).await;
        let mut failures = Vec::new();
        let candidates = self.plan(&analysis, options, &mut failures);
        if candidates.is_empty() {
            return Err(if failures.is_empty() {
                OcrError::NoProviders
            } else {
                OcrError::Exhausted { failures }
            });
        }

        info!(
            "[{}] {} ({} bytes, {:?}, handwriting {:.2}) -> [{}]",
            request_id,
            analysis.document.file_name,
            analysis.document.len(),
            analysis.document.kind(),
            analysis.handwriting_score,
            candidates.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
        );

        let mut attempts = Vec::new();
        let mut best: Option<(OcrResult, ValidationResult)> = None;

        for descriptor in &candidates {
            let verdict = self
                .try_provider(request_id, descriptor, &analysis, options, cancel, &mut attempts)
                .await?;
            match verdict {
                Verdict::Accepted(result, validation, disposition) => {
                    return Ok(self.finish(
                        request_id, result, validation, disposition, &analysis, options, attempts,
                    ));
                }
                Verdict::Rejected(result, validation) => {
                    failures.push(ProviderFailure {
                        provider: descriptor.name.clone(),
                        reason: format!(
                            "quality score {} below threshold ({})",
                            validation.quality_score,
                            validation.issues.join("; ")
                        ),
                    });
                    let better = best
                        .as_ref()
                        .map_or(true, |(b, _)| result.confidence > b.confidence);
                    if result.has_text() && better {
                        best = Some((result, validation));
                    }
                }
                Verdict::Failed(reason) => failures.push(ProviderFailure {
                    provider: descriptor.name.clone(),
                    reason,
                }),
            }
        }

        match best {
            Some((result, validation)) => {
                warn!(
                    "[{}] all providers exhausted, returning best effort from {} (confidence {:.2})",
                    request_id, result.provider, result.confidence
                );
                Ok(self.finish(
                    request_id,
                    result,
                    validation,
                    Disposition::BestEffort,
                    &analysis,
                    options,
                    attempts,
                ))
            }
            None => {
                error!(
                    "[{}] all providers failed: {}",
                    request_id,
                    describe_failures(&failures)
                );
                Err(OcrError::Exhausted { failures })
            }
        }
    }

    /// Handwriting score, page count and image cleanup. PDFs and images are
    /// parsed off the async workers.
    async fn analyse(&self, document: Document) -> Analysis {
        if document.kind() == DocumentKind::Text {
            return analyse(&self.preprocessor, self.handwriting, document);
        }

        let preprocessor = self.preprocessor.clone();
        let detector = self.handwriting;
        let original = document.clone();
        match tokio::task::spawn_blocking(move || analyse(&preprocessor, detector, document)).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Document analysis failed for {}: {}", original.file_name, e);
                Analysis {
                    document: original,
                    preprocessed: false,
                    handwriting_score: 0.0,
                    page_count: None,
                }
            }
        }
    }

    /// Candidate providers in the order they will be tried.
    fn plan(
        &self,
        analysis: &Analysis,
        options: &ProcessOptions,
        failures: &mut Vec<ProviderFailure>,
    ) -> Vec<ProviderDescriptor> {
        let available = self.registry.list_available();
        let mut ordered = Vec::with_capacity(available.len());

        if let Some(preferred) = options.preferred_provider.as_deref() {
            match self.registry.resolve(preferred) {
                Some(d) if d.available => ordered.push(d),
                Some(_) => warn!(
                    "Preferred provider {} has no credentials configured, using priority order",
                    preferred
                ),
                None => warn!("Preferred provider {} is unknown, using priority order", preferred),
            }
        }
        if self.handwriting.prefers_handwriting_provider(analysis.handwriting_score) {
            ordered.extend(available.iter().filter(|d| d.supports_handwriting).cloned());
        }
        ordered.extend(available);

        let mut seen = HashSet::new();
        ordered.retain(|d| seen.insert(d.name.clone()));

        ordered
            .into_iter()
            .filter(|d| match self.skip_reason(d, analysis) {
                Some(reason) => {
                    debug!("Skipping {}: {}", d.name, reason);
                    failures.push(ProviderFailure {
                        provider: d.name.clone(),
                        reason,
                    });
                    false
                }
                None => true,
            })
            .collect()
    }

    fn skip_reason(&self, descriptor: &ProviderDescriptor, analysis: &Analysis) -> Option<String> {
        let document = &analysis.document;
        if !self.providers.contains_key(&descriptor.name) {
            return Some("no adapter registered".to_string());
        }

        let supported = match document.kind() {
            DocumentKind::Pdf => descriptor.supports_pdf,
            DocumentKind::Image => descriptor.supports_image,
            DocumentKind::Text => descriptor.supports_text,
        };
        if !supported {
            return Some(format!("does not support {} documents", document.effective_mime()));
        }

        if document.len() as u64 > descriptor.max_file_size_mb * MB {
            return Some(format!(
                "file exceeds the {}MB provider limit",
                descriptor.max_file_size_mb
            ));
        }

        match (descriptor.max_pages, analysis.page_count) {
            (Some(max), Some(pages)) if pages > max => {
                Some(format!("{} pages exceeds the {}-page limit", pages, max))
            }
            _ => None,
        }
    }

    async fn try_provider(
        &self,
        request_id: &str,
        descriptor: &ProviderDescriptor,
        analysis: &Analysis,
        options: &ProcessOptions,
        cancel: &CancellationToken,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<Verdict, OcrError> {
        let Some(provider) = self.providers.get(&descriptor.name).cloned() else {
            return Ok(Verdict::Failed("no adapter registered".to_string()));
        };
        let document = &analysis.document;
        let limiter = self.limiter_for(descriptor);
        let key = cache_key(
            &descriptor.name,
            &json!({
                "sha256": document.content_hash(),
                "mimeType": document.effective_mime(),
                "preprocessed": analysis.preprocessed,
                "models": descriptor.models,
            }),
        );
        let retry = BackoffPolicy::new(
            Duration::from_millis(descriptor.retry_base_ms),
            Duration::from_millis(descriptor.rate_limit.cooldown_period_ms),
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let call = timed_call(
                Arc::clone(&provider),
                document.clone(),
                descriptor.name.clone(),
                descriptor.timeout_ms,
            );
            let outcome = limiter.schedule(key.clone(), self.cache_ttl, cancel, call).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let failure = match outcome {
                Ok(result) if result.success => {
                    return Ok(self.judge(
                        request_id, descriptor, attempt, latency_ms, result, options, attempts,
                    ));
                }
                Ok(result) => LimiterError::Call(ProviderError::Malformed {
                    provider: descriptor.name.clone(),
                    message: result
                        .error
                        .unwrap_or_else(|| "provider reported failure".to_string()),
                }),
                Err(LimiterError::Cancelled { .. }) => return Err(OcrError::Cancelled),
                Err(e) => e,
            };

            attempts.push(AttemptRecord {
                provider: descriptor.name.clone(),
                attempt,
                latency_ms,
                outcome: AttemptOutcome::Error,
                quality_score: None,
                confidence: None,
                error: Some(failure.to_string()),
            });

            let transient = matches!(&failure, LimiterError::Call(e) if e.is_transient());
            if !transient || attempt > descriptor.max_retries {
                warn!(
                    "[{}] {} attempt {}: error in {}ms: {}",
                    request_id, descriptor.name, attempt, latency_ms, failure
                );
                return Ok(Verdict::Failed(failure.to_string()));
            }

            let wait = retry.delay(attempt - 1);
            warn!(
                "[{}] {} attempt {}: transient error in {}ms, retrying in {:?}: {}",
                request_id, descriptor.name, attempt, latency_ms, wait, failure
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(OcrError::Cancelled),
            }
        }
    }

    /// Apply the quality gate to a successful provider result.
    #[allow(clippy::too_many_arguments)]
    fn judge(
        &self,
        request_id: &str,
        descriptor: &ProviderDescriptor,
        attempt: u32,
        latency_ms: u64,
        result: OcrResult,
        options: &ProcessOptions,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Verdict {
        let validation = self.validator.validate(&result);
        let usable =
            result.text.trim().chars().count() > self.validator.config().usable_text_length;

        let outcome = if validation.is_valid {
            AttemptOutcome::Accepted
        } else if !options.require_high_quality && usable {
            AttemptOutcome::Degraded
        } else {
            AttemptOutcome::Rejected
        };

        info!(
            "[{}] {} attempt {}: {:?} in {}ms (score {}, confidence {:.2}, {} chars)",
            request_id,
            descriptor.name,
            attempt,
            outcome,
            latency_ms,
            validation.quality_score,
            result.confidence,
            result.text.len()
        );
        attempts.push(AttemptRecord {
            provider: descriptor.name.clone(),
            attempt,
            latency_ms,
            outcome,
            quality_score: Some(validation.quality_score),
            confidence: Some(result.confidence),
            error: None,
        });

        match outcome {
            AttemptOutcome::Accepted => Verdict::Accepted(result, validation, Disposition::Accepted),
            AttemptOutcome::Degraded => Verdict::Accepted(result, validation, Disposition::Degraded),
            _ => Verdict::Rejected(result, validation),
        }
    }

    /// Second pass on accepted text: quality tier and booking field hints.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request_id: &str,
        mut result: OcrResult,
        validation: ValidationResult,
        disposition: Disposition,
        analysis: &Analysis,
        options: &ProcessOptions,
        attempts: Vec<AttemptRecord>,
    ) -> ProcessOutcome {
        result.metadata.quality = Some(self.validator.quality_tier(result.confidence).to_string());
        if result.metadata.page_count.is_none() {
            result.metadata.page_count = analysis.page_count;
        }

        let BookingHints {
            fields,
            missing_fields,
        } = self.hints.hints(&result.text, result.structured_data.as_ref());
        result.structured_data = (!fields.is_empty()).then_some(Value::Object(fields));

        let counter = match disposition {
            Disposition::Accepted => &self.counters.accepted,
            Disposition::Degraded => &self.counters.degraded,
            Disposition::BestEffort => &self.counters.best_effort,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        debug!(
            "[{}] {:?} from {}, missing fields: {:?}",
            request_id, disposition, result.provider, missing_fields
        );

        ProcessOutcome {
            request_id: request_id.to_string(),
            result,
            validation,
            disposition,
            missing_fields,
            handwriting_score: analysis.handwriting_score,
            preprocessed: analysis.preprocessed,
            document_type: options.document_type.clone(),
            attempts,
        }
    }

    fn limiter_for(&self, descriptor: &ProviderDescriptor) -> RateLimiter<OcrResult> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(descriptor.name.clone())
            .or_insert_with(|| {
                RateLimiter::new(
                    descriptor.name.clone(),
                    LimiterSettings::from_config(
                        &descriptor.rate_limit,
                        self.queue_max_size,
                        self.cache_capacity,
                    ),
                )
            })
            .clone()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let mut providers: Vec<LimiterStats> = self
            .limiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|l| l.stats())
            .collect();
        providers.sort_by(|a, b| a.operation.cmp(&b.operation));

        OrchestratorStats {
            max_concurrent_requests: self.max_concurrent_requests,
            available_permits: self.permits.available_permits(),
            queue_length: providers.iter().map(|p| p.queue_length).sum(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            best_effort: self.counters.best_effort.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            providers,
        }
    }

    /// Probe every configured provider concurrently.
    pub async fn health(&self) -> Vec<ProviderHealth> {
        let checks = self.registry.all().into_iter().map(|descriptor| {
            let provider = self.providers.get(&descriptor.name).cloned();
            async move {
                let provider = match provider {
                    Some(p) if descriptor.available => p,
                    _ => {
                        let reason = if descriptor.available {
                            "no adapter registered"
                        } else {
                            "credentials not configured"
                        };
                        return ProviderHealth {
                            name: descriptor.name,
                            priority: descriptor.priority,
                            available: descriptor.available,
                            healthy: false,
                            latency_ms: None,
                            error: Some(reason.to_string()),
                        };
                    }
                };

                let started = Instant::now();
                let checked = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, provider.health_check()).await;
                let latency_ms = started.elapsed().as_millis() as u64;
                let error = match checked {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!(
                        "health check timed out after {}s",
                        HEALTH_CHECK_TIMEOUT.as_secs()
                    )),
                };
                ProviderHealth {
                    name: descriptor.name,
                    priority: descriptor.priority,
                    available: true,
                    healthy: error.is_none(),
                    latency_ms: Some(latency_ms),
                    error,
                }
            }
        });
        join_all(checks).await
    }
}

fn analyse(preprocessor: &Preprocessor, detector: HandwritingDetector, document: Document) -> Analysis {
    let handwriting_score = detector.score(&document);
    let page_count = match document.kind() {
        DocumentKind::Pdf => pdf_page_count(&document.data),
        _ => None,
    };
    match preprocessor.prepare(&document) {
        Some(prepared) => Analysis {
            document: prepared,
            preprocessed: true,
            handwriting_score,
            page_count,
        },
        None => Analysis {
            document,
            preprocessed: false,
            handwriting_score,
            page_count,
        },
    }
}

/// The queued call: one provider invocation bounded by the provider timeout.
/// Queue wait happens outside it.
fn timed_call(
    provider: Arc<dyn OcrProvider>,
    document: Document,
    name: String,
    timeout_ms: u64,
) -> impl Fn() -> BoxFuture<'static, Result<OcrResult, ProviderError>> + Send + Sync + 'static {
    move || {
        let provider = Arc::clone(&provider);
        let document = document.clone();
        let name = name.clone();
        async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), provider.process(&document)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: name,
                    timeout_ms,
                }),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ProviderSettings, RateLimitSettings};
    use crate::ocr::native::fixture_pdf;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    pub(crate) const BOOKING_TEXT: &str = "Booking confirmation HMXY42\n\
        Guest: Maria Santos\n\
        Check-in: 2024-05-01\n\
        Check-out: 2024-05-05\n\
        Total: EUR 540.00";

    /// Provider that replays a fixed script of responses.
    pub(crate) struct ScriptedProvider {
        name: String,
        delay: Duration,
        script: Mutex<VecDeque<Result<OcrResult, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub(crate) fn new(name: &str, script: Vec<Result<OcrResult, ProviderError>>) -> Arc<Self> {
            Self::slow(name, Duration::ZERO, script)
        }

        pub(crate) fn slow(
            name: &str,
            delay: Duration,
            script: Vec<Result<OcrResult, ProviderError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                delay,
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl OcrProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(&self, _document: &Document) -> Result<OcrResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Err(ProviderError::Malformed {
                    provider: self.name.clone(),
                    message: "script exhausted".to_string(),
                })
            })
        }
    }

    pub(crate) fn text(provider: &str, text: &str, confidence: f64) -> Result<OcrResult, ProviderError> {
        Ok(OcrResult::success(provider, text, confidence))
    }

    fn http(provider: &str, status: u16) -> Result<OcrResult, ProviderError> {
        Err(ProviderError::from_status(provider, status, "upstream said no".to_string()))
    }

    pub(crate) fn settings(name: &str, priority: u32) -> ProviderSettings {
        ProviderSettings {
            name: name.to_string(),
            kind: ProviderKind::MistralOcr,
            priority,
            credential_env: None,
            max_retries: 0,
            retry_base_ms: 100,
            timeout_ms: 1_000,
            cost_per_page: 0.0,
            supports_pdf: true,
            supports_image: true,
            supports_text: Some(true),
            structured_extraction: false,
            supports_handwriting: false,
            max_file_size_mb: 20,
            max_pages: None,
            rate_limit: RateLimitSettings::default(),
            models: Vec::new(),
        }
    }

    pub(crate) fn orchestrator(
        providers: Vec<ProviderSettings>,
        adapters: &[Arc<ScriptedProvider>],
    ) -> OcrOrchestrator {
        let config = ServiceConfig {
            providers,
            ..ServiceConfig::default()
        };
        orchestrator_with(&config, adapters)
    }

    /// Every configured provider available, backed by the given scripts.
    pub(crate) fn orchestrator_with(
        config: &ServiceConfig,
        adapters: &[Arc<ScriptedProvider>],
    ) -> OcrOrchestrator {
        let registry = Arc::new(ProviderRegistry::with_env(config, |_| true));
        adapters.iter().fold(OcrOrchestrator::new(config, registry), |o, p| {
            o.with_provider(p.name.clone(), p.clone())
        })
    }

    pub(crate) fn text_doc(body: &str) -> Document {
        Document::new("booking.txt", "text/plain", body.as_bytes().to_vec())
    }

    fn three() -> Vec<ProviderSettings> {
        vec![settings("p1", 1), settings("p2", 2), settings("p3", 3)]
    }

    #[tokio::test]
    async fn test_fails_over_in_priority_order() {
        let p1 = ScriptedProvider::new("p1", vec![http("p1", 400)]);
        let p2 = ScriptedProvider::new("p2", vec![text("p2", BOOKING_TEXT, 0.7)]);
        let p3 = ScriptedProvider::new("p3", vec![text("p3", BOOKING_TEXT, 0.99)]);
        let orch = orchestrator(three(), &[p1.clone(), p2.clone(), p3.clone()]);

        let outcome = orch
            .process(text_doc("a"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.result.provider, "p2");
        assert_eq!(outcome.disposition, Disposition::Accepted);
        assert!(outcome.validation.quality_score >= 60);
        assert_eq!(p3.calls(), 0);

        let trail: Vec<_> = outcome
            .attempts
            .iter()
            .map(|a| (a.provider.as_str(), a.outcome))
            .collect();
        assert_eq!(
            trail,
            vec![("p1", AttemptOutcome::Error), ("p2", AttemptOutcome::Accepted)]
        );
        assert_eq!(outcome.result.metadata.quality.as_deref(), Some("poor"));
    }

    #[tokio::test]
    async fn test_second_pass_adds_hints() {
        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.95)]);
        let orch = orchestrator(vec![settings("p1", 1)], &[p1]);

        let outcome = orch
            .process(text_doc("b"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let fields = outcome.result.structured_data.unwrap();
        assert_eq!(fields["checkIn"], "2024-05-01");
        assert_eq!(fields["guestName"], "Maria Santos");
        assert!(outcome.missing_fields.is_empty());
        assert_eq!(outcome.result.metadata.quality.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_best_effort_when_all_fail_quality() {
        let garbled = "lorem ~~ ipsum ^^ dolor {{ sit }} amet <<>> consectetur adipiscing elit sed do eiu";
        let p1 = ScriptedProvider::new("p1", vec![text("p1", garbled, 0.5)]);
        let p2 = ScriptedProvider::new("p2", vec![text("p2", "~~ x ~~ y", 0.2)]);
        let p3 = ScriptedProvider::new("p3", vec![http("p3", 400)]);
        let orch = orchestrator(three(), &[p1, p2, p3]);

        let options = ProcessOptions {
            require_high_quality: true,
            ..ProcessOptions::default()
        };
        let outcome = orch
            .process(text_doc("c"), &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.disposition, Disposition::BestEffort);
        assert_eq!(outcome.result.provider, "p1");
        assert_eq!(outcome.result.text, garbled);
        assert!(!outcome.validation.is_valid);
        assert_eq!(outcome.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_degraded_text_accepted_without_high_quality() {
        let p1 = ScriptedProvider::new("p1", vec![text("p1", "some words ~~ ^^ {{", 0.3)]);
        let p2 = ScriptedProvider::new("p2", vec![text("p2", BOOKING_TEXT, 0.99)]);
        let orch = orchestrator(three(), &[p1, p2.clone()]);

        let outcome = orch
            .process(text_doc("d"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.disposition, Disposition::Degraded);
        assert_eq!(outcome.result.provider, "p1");
        assert_eq!(p2.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_lists_every_failure() {
        let p1 = ScriptedProvider::new("p1", vec![http("p1", 400)]);
        let p2 = ScriptedProvider::new("p2", vec![http("p2", 401)]);
        let p3 = ScriptedProvider::new("p3", vec![text("p3", "   ", 0.9)]);
        let orch = orchestrator(three(), &[p1, p2, p3]);

        let err = orch
            .process(text_doc("e"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            OcrError::Exhausted { failures } => {
                let names: Vec<_> = failures.iter().map(|f| f.provider.as_str()).collect();
                assert_eq!(names, vec!["p1", "p2", "p3"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let message = err.to_string();
        assert!(message.contains("p1") && message.contains("p2") && message.contains("p3"));
        assert_eq!(err.last_provider(), Some("p3"));
        assert_eq!(orch.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_preferred_provider_goes_first() {
        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.99)]);
        let p3 = ScriptedProvider::new("p3", vec![text("p3", BOOKING_TEXT, 0.95)]);
        let orch = orchestrator(three(), &[p1.clone(), p3.clone()]);

        let options = ProcessOptions {
            preferred_provider: Some("p3".to_string()),
            ..ProcessOptions::default()
        };
        let outcome = orch
            .process(text_doc("f"), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.result.provider, "p3");
        assert_eq!(p1.calls(), 0);

        // Unknown preference falls back to priority order.
        let options = ProcessOptions {
            preferred_provider: Some("tesseract".to_string()),
            ..ProcessOptions::default()
        };
        let outcome = orch
            .process(text_doc("g"), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.result.provider, "p1");
    }

    #[tokio::test]
    async fn test_preferred_provider_without_credentials_is_ignored() {
        let mut locked = settings("p2", 2);
        locked.credential_env = Some("P2_API_KEY".to_string());
        let config = ServiceConfig {
            providers: vec![settings("p1", 1), locked],
            ..ServiceConfig::default()
        };
        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.99)]);
        let p2 = ScriptedProvider::new("p2", vec![text("p2", BOOKING_TEXT, 0.99)]);
        let registry = Arc::new(ProviderRegistry::with_env(&config, |var| var != "P2_API_KEY"));
        let orch = OcrOrchestrator::new(&config, registry)
            .with_provider("p1".to_string(), p1.clone())
            .with_provider("p2".to_string(), p2.clone());

        let options = ProcessOptions {
            preferred_provider: Some("p2".to_string()),
            ..ProcessOptions::default()
        };
        let outcome = orch
            .process(text_doc("g2"), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.result.provider, "p1");
        assert_eq!(p2.calls(), 0);
    }

    #[tokio::test]
    async fn test_text_documents_skip_providers_without_text_support() {
        let mut ai = settings("ai", 1);
        ai.supports_text = Some(false);
        let native = settings("native", 2);

        let ai_provider = ScriptedProvider::new("ai", vec![text("ai", BOOKING_TEXT, 0.99)]);
        let native_provider = ScriptedProvider::new("native", vec![text("native", BOOKING_TEXT, 0.95)]);
        let orch = orchestrator(vec![ai, native], &[ai_provider.clone(), native_provider.clone()]);

        let outcome = orch
            .process(text_doc("t"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.result.provider, "native");
        assert_eq!(ai_provider.calls(), 0);
        assert_eq!(native_provider.calls(), 1);
        assert!(outcome.attempts.iter().all(|a| a.provider == "native"));
        assert!(orch.stats().providers.iter().all(|p| p.operation != "ai"));

        // A preference does not override the capability check.
        let options = ProcessOptions {
            preferred_provider: Some("ai".to_string()),
            ..ProcessOptions::default()
        };
        let err = orch
            .process(text_doc("u"), &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(ai_provider.calls(), 0);
        assert!(err.to_string().contains("does not support text/plain"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_same_provider() {
        let mut p1_settings = settings("p1", 1);
        p1_settings.max_retries = 2;
        let p1 = ScriptedProvider::new(
            "p1",
            vec![http("p1", 503), http("p1", 502), text("p1", BOOKING_TEXT, 0.9)],
        );
        let p2 = ScriptedProvider::new("p2", vec![text("p2", BOOKING_TEXT, 0.9)]);
        let orch = orchestrator(vec![p1_settings, settings("p2", 2)], &[p1.clone(), p2.clone()]);

        let outcome = orch
            .process(text_doc("h"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.result.provider, "p1");
        assert_eq!(p1.calls(), 3);
        assert_eq!(p2.calls(), 0);
        let numbers: Vec<_> = outcome.attempts.iter().map(|a| a.attempt).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_triggers_failover() {
        let mut slow_settings = settings("p1", 1);
        slow_settings.timeout_ms = 100;
        let p1 = ScriptedProvider::slow(
            "p1",
            Duration::from_secs(5),
            vec![text("p1", BOOKING_TEXT, 0.99)],
        );
        let p2 = ScriptedProvider::new("p2", vec![text("p2", BOOKING_TEXT, 0.9)]);
        let orch = orchestrator(vec![slow_settings, settings("p2", 2)], &[p1, p2]);

        let outcome = orch
            .process(text_doc("i"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.result.provider, "p2");
        let first = &outcome.attempts[0];
        assert_eq!(first.outcome, AttemptOutcome::Error);
        assert!(first.error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_unwinds_queued_work() {
        let mut slow_settings = settings("p1", 1);
        slow_settings.timeout_ms = 120_000;
        let p1 = ScriptedProvider::slow(
            "p1",
            Duration::from_secs(60),
            vec![text("p1", BOOKING_TEXT, 0.99)],
        );
        let orch = orchestrator(vec![slow_settings], &[p1]);

        let options = ProcessOptions {
            deadline: Some(Duration::from_secs(1)),
            ..ProcessOptions::default()
        };
        let err = orch
            .process(text_doc("j"), &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::DeadlineExceeded(_)));

        let stats = orch.stats();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.available_permits, stats.max_concurrent_requests);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.99)]);
        let orch = orchestrator(vec![settings("p1", 1)], &[p1.clone()]);
        let token = CancellationToken::new();
        token.cancel();

        let err = orch
            .process(text_doc("k"), &ProcessOptions::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::Cancelled));
        assert_eq!(p1.calls(), 0);
    }

    #[tokio::test]
    async fn test_identical_document_served_from_cache() {
        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.95)]);
        let orch = orchestrator(vec![settings("p1", 1)], &[p1.clone()]);

        for _ in 0..2 {
            let outcome = orch
                .process(text_doc("same"), &ProcessOptions::default(), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.result.text, BOOKING_TEXT);
        }
        assert_eq!(p1.calls(), 1);
        assert_eq!(orch.stats().providers[0].cache_hits, 1);
    }

    #[tokio::test]
    async fn test_size_limits() {
        let orch = orchestrator(vec![settings("p1", 1)], &[]);
        let huge = Document::new("big.pdf", "application/pdf", vec![0u8; 21 * 1024 * 1024]);
        let err = orch
            .process(huge, &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::TooLarge { .. }));

        let empty = Document::new("empty.pdf", "application/pdf", Vec::new());
        let err = orch
            .process(empty, &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::EmptyDocument));
    }

    #[tokio::test]
    async fn test_handwriting_bias_and_capabilities() {
        let mut no_images = settings("p1", 1);
        no_images.supports_image = false;
        let plain = settings("p2", 2);
        let mut handwriting = settings("p3", 3);
        handwriting.supports_handwriting = true;

        let p1 = ScriptedProvider::new("p1", vec![text("p1", BOOKING_TEXT, 0.99)]);
        let p2 = ScriptedProvider::new("p2", vec![text("p2", BOOKING_TEXT, 0.99)]);
        let p3 = ScriptedProvider::new("p3", vec![text("p3", BOOKING_TEXT, 0.99)]);
        let orch = orchestrator(vec![no_images, plain, handwriting], &[p1.clone(), p2.clone(), p3]);

        let photo = Document::new("note.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]);
        let outcome = orch
            .process(photo, &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.handwriting_score > 0.4);
        assert_eq!(outcome.result.provider, "p3");
        assert_eq!(p1.calls(), 0);
        assert_eq!(p2.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_adapters_is_no_providers() {
        let config = ServiceConfig::default();
        let registry = Arc::new(ProviderRegistry::with_env(&config, |_| false));
        let mut config_without_native = config.clone();
        config_without_native.providers.retain(|p| p.credential_env.is_some());
        registry.reload(&config_without_native, |_| false);

        let orch = OcrOrchestrator::new(&config, registry);
        let err = orch
            .process(text_doc("l"), &ProcessOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::NoProviders));
    }

    #[tokio::test]
    async fn test_native_only_chain_accepts_text_pdf() {
        let config = ServiceConfig::default();
        let registry = Arc::new(ProviderRegistry::with_env(&config, |_| false));
        let orch = OcrOrchestrator::from_config(&config, registry).unwrap();

        let mut lines = vec![
            "Booking confirmation for your stay",
            "Check-in: 2024-05-01",
            "Check-out: 2024-05-05",
        ];
        lines.extend(std::iter::repeat("Please present this confirmation at the reception desk.").take(20));
        let pdf = fixture_pdf(&lines);
        assert!(pdf.len() >= 1024);

        let outcome = orch
            .process(
                Document::new("booking.pdf", "application/pdf", pdf),
                &ProcessOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.result.provider, crate::ocr::native::NATIVE_PROVIDER);
        assert_eq!(outcome.disposition, Disposition::Accepted);
        assert!(outcome.validation.quality_score >= 60);
        assert_eq!(outcome.result.metadata.page_count, Some(1));
    }

    #[tokio::test]
    async fn test_health_reports_every_provider() {
        let p1 = ScriptedProvider::new("p1", vec![]);
        let mut locked = settings("p2", 2);
        locked.credential_env = Some("P2_API_KEY".to_string());
        let config = ServiceConfig {
            providers: vec![settings("p1", 1), locked],
            ..ServiceConfig::default()
        };
        let registry = Arc::new(ProviderRegistry::with_env(&config, |_| false));
        let orch = OcrOrchestrator::new(&config, registry).with_provider("p1", p1);

        let health = orch.health().await;
        assert_eq!(health.len(), 2);
        assert!(health[0].healthy && health[0].latency_ms.is_some());
        assert!(!health[1].available && !health[1].healthy);
    }
}
