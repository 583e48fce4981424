//! Service configuration.
//!
//! Loaded from `OCR_CONFIG_PATH` or `configs/ocr.json` when present, falling
//! back to built-in defaults, then overridden from the environment. Every
//! quality and rate-limit constant is a tunable here rather than a literal
//! in the components that use it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::ocr::mistral::MISTRAL_PROVIDER;
use crate::ocr::native::NATIVE_PROVIDER;
use crate::ocr::openrouter::OPENROUTER_PROVIDER;

const DEFAULT_CONFIG_PATH: &str = "configs/ocr.json";

/// Which adapter implementation backs a configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenrouterVision,
    MistralOcr,
    NativePdf,
}

/// Top-level configuration for the OCR service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub bind_addr: String,
    /// Ceiling on concurrently running orchestrations.
    pub max_concurrent_requests: usize,
    /// Per-provider queue bound; enqueues beyond it are rejected.
    pub queue_max_size: usize,
    pub max_file_size_mb: u64,
    pub max_batch_size: usize,
    pub default_batch_concurrency: usize,
    pub cache: CacheSettings,
    pub quality: QualityConfig,
    pub handwriting_threshold: f32,
    pub preprocess: PreprocessConfig,
    pub providers: Vec<ProviderSettings>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            max_concurrent_requests: 5,
            queue_max_size: 100,
            max_file_size_mb: 20,
            max_batch_size: 10,
            default_batch_concurrency: 3,
            cache: CacheSettings::default(),
            quality: QualityConfig::default(),
            handwriting_threshold: 0.4,
            preprocess: PreprocessConfig::default(),
            providers: default_providers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 500,
            ttl_secs: 3600,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Confidence bands used to label result quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfidenceBands {
    pub minimum: f64,
    pub warning: f64,
    pub good: f64,
}

impl Default for ConfidenceBands {
    fn default() -> Self {
        Self {
            minimum: 0.6,
            warning: 0.8,
            good: 0.9,
        }
    }
}

/// Punctuation that is normal in booking documents and markdown output.
pub const DEFAULT_ORDINARY_PUNCTUATION: &str = ".,:;-–—/()[]'\"‘’“”@#%&+*!?€$£_|=";

/// Quality gate policy. Penalties subtract from a 100-point baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityConfig {
    pub accept_score: u8,
    pub min_text_length: usize,
    /// Minimum characters for a result to count as usable at all.
    pub usable_text_length: usize,
    pub max_artifact_ratio: f64,
    /// Non-alphanumeric characters that do not count as artifacts.
    pub ordinary_punctuation: String,
    pub min_domain_indicators: usize,
    pub min_confidence: f64,
    pub short_text_penalty: u8,
    pub artifact_penalty: u8,
    pub indicator_penalty: u8,
    pub confidence_penalty: u8,
    pub bands: ConfidenceBands,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            accept_score: 60,
            min_text_length: 50,
            usable_text_length: 10,
            max_artifact_ratio: 0.05,
            ordinary_punctuation: DEFAULT_ORDINARY_PUNCTUATION.to_string(),
            min_domain_indicators: 2,
            min_confidence: 0.8,
            short_text_penalty: 40,
            artifact_penalty: 20,
            indicator_penalty: 20,
            confidence_penalty: 15,
            bands: ConfidenceBands::default(),
        }
    }
}

/// Image normalization applied before dispatching photos.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreprocessConfig {
    pub enabled: bool,
    pub max_dimension: u32,
    pub min_width: u32,
    pub contrast: f32,
    pub sharpen_sigma: f32,
    pub sharpen_threshold: i32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_dimension: 2048,
            min_width: 1000,
            contrast: 15.0,
            sharpen_sigma: 1.0,
            sharpen_threshold: 2,
        }
    }
}

/// Per-provider queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub requests_per_minute: usize,
    /// Max dispatches in any rolling second.
    pub burst_limit: usize,
    /// Upper bound on the queue's rate-limit backoff.
    pub cooldown_period_ms: u64,
    pub backoff_base_ms: u64,
    /// Rate-limit retries before the caller gets a terminal error.
    pub queue_retries: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_limit: 10,
            cooldown_period_ms: 60_000,
            backoff_base_ms: 1_000,
            queue_retries: 3,
        }
    }
}

/// Static description of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKind,
    pub priority: u32,
    /// Env var whose presence makes the provider available. `None` = always available.
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub cost_per_page: f64,
    #[serde(default = "default_true")]
    pub supports_pdf: bool,
    #[serde(default = "default_true")]
    pub supports_image: bool,
    /// Accepts text/plain uploads. Unset means only the local extractor does.
    #[serde(default)]
    pub supports_text: Option<bool>,
    #[serde(default)]
    pub structured_extraction: bool,
    #[serde(default)]
    pub supports_handwriting: bool,
    #[serde(default = "default_provider_file_mb")]
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Ordered model strategy for AI providers.
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_provider_file_mb() -> u64 {
    20
}

fn default_providers() -> Vec<ProviderSettings> {
    vec![
        ProviderSettings {
            name: OPENROUTER_PROVIDER.to_string(),
            kind: ProviderKind::OpenrouterVision,
            priority: 1,
            credential_env: Some("OPENROUTER_API_KEY".to_string()),
            max_retries: 2,
            retry_base_ms: 500,
            timeout_ms: 60_000,
            cost_per_page: 0.0025,
            supports_pdf: true,
            supports_image: true,
            supports_text: Some(false),
            structured_extraction: true,
            supports_handwriting: true,
            max_file_size_mb: 20,
            max_pages: Some(50),
            rate_limit: RateLimitSettings {
                requests_per_minute: 15,
                burst_limit: 3,
                ..RateLimitSettings::default()
            },
            models: vec![
                "google/gemini-2.5-pro".to_string(),
                "google/gemini-2.5-flash".to_string(),
            ],
        },
        ProviderSettings {
            name: MISTRAL_PROVIDER.to_string(),
            kind: ProviderKind::MistralOcr,
            priority: 2,
            credential_env: Some("MISTRAL_API_KEY".to_string()),
            max_retries: 2,
            retry_base_ms: 500,
            timeout_ms: 45_000,
            cost_per_page: 0.001,
            supports_pdf: true,
            supports_image: true,
            supports_text: Some(false),
            structured_extraction: false,
            supports_handwriting: false,
            max_file_size_mb: 50,
            max_pages: Some(1000),
            rate_limit: RateLimitSettings {
                requests_per_minute: 60,
                burst_limit: 6,
                ..RateLimitSettings::default()
            },
            models: vec!["mistral-ocr-latest".to_string()],
        },
        ProviderSettings {
            name: NATIVE_PROVIDER.to_string(),
            kind: ProviderKind::NativePdf,
            priority: 3,
            credential_env: None,
            max_retries: 0,
            retry_base_ms: 0,
            timeout_ms: 10_000,
            cost_per_page: 0.0,
            supports_pdf: true,
            supports_image: false,
            supports_text: Some(true),
            structured_extraction: false,
            supports_handwriting: false,
            max_file_size_mb: 100,
            max_pages: None,
            rate_limit: RateLimitSettings {
                requests_per_minute: 600,
                burst_limit: 50,
                ..RateLimitSettings::default()
            },
            models: Vec::new(),
        },
    ]
}

impl ServiceConfig {
    /// Load config from `OCR_CONFIG_PATH`, `configs/ocr.json`, or defaults, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("OCR_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            info!("No config at {:?}, using built-in defaults", path);
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: ServiceConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        info!(
            "Loaded config from {:?} ({} providers)",
            path,
            config.providers.len()
        );
        Ok(config)
    }

    /// Apply `OCR_*` overrides using the given lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = lookup("OCR_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(v) = lookup("OCR_MAX_CONCURRENT_REQUESTS") {
            self.max_concurrent_requests = v
                .parse()
                .with_context(|| format!("Invalid OCR_MAX_CONCURRENT_REQUESTS: {}", v))?;
        }
        if let Some(v) = lookup("OCR_QUEUE_MAX_SIZE") {
            self.queue_max_size = v
                .parse()
                .with_context(|| format!("Invalid OCR_QUEUE_MAX_SIZE: {}", v))?;
        }
        if let Some(v) = lookup("OCR_MAX_FILE_SIZE_MB") {
            self.max_file_size_mb = v
                .parse()
                .with_context(|| format!("Invalid OCR_MAX_FILE_SIZE_MB: {}", v))?;
        }
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> usize {
        (self.max_file_size_mb as usize) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_three_providers() {
        let config = ServiceConfig::default();
        let names: Vec<_> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec![OPENROUTER_PROVIDER, MISTRAL_PROVIDER, NATIVE_PROVIDER]);
        assert_eq!(config.quality.accept_score, 60);
        assert_eq!(config.default_batch_concurrency, 3);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "maxConcurrentRequests": 8,
            "quality": { "acceptScore": 70 },
            "providers": [
                { "name": "native_pdf", "kind": "native_pdf", "priority": 1 }
            ]
        }"#;
        let config: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_concurrent_requests, 8);
        assert_eq!(config.quality.accept_score, 70);
        assert_eq!(config.quality.min_text_length, 50);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].timeout_ms, 30_000);
        assert_eq!(config.providers[0].rate_limit.requests_per_minute, 60);
        assert!(config.providers[0].supports_pdf);
        assert_eq!(config.providers[0].supports_text, None);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "OCR_QUEUE_MAX_SIZE" => Some("7".to_string()),
                "OCR_BIND_ADDR" => Some("127.0.0.1:9000".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.queue_max_size, 7);
        assert_eq!(config.bind_addr, "127.0.0.1:9000");

        let err = config.apply_env_overrides(|key| {
            (key == "OCR_MAX_FILE_SIZE_MB").then(|| "lots".to_string())
        });
        assert!(err.is_err());
    }
}
