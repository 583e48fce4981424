//! Provider registry: which OCR providers exist, in what order, and which are usable.
//!
//! Descriptors are immutable once built; `reload` swaps the whole set.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::config::{ProviderKind, ProviderSettings, RateLimitSettings, ServiceConfig};
use crate::orchestrator::OcrError;

/// One configured provider, with availability resolved from the environment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    pub priority: u32,
    pub available: bool,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub timeout_ms: u64,
    pub cost_per_page: f64,
    pub supports_pdf: bool,
    pub supports_image: bool,
    pub supports_text: bool,
    pub structured_extraction: bool,
    pub supports_handwriting: bool,
    pub max_file_size_mb: u64,
    pub max_pages: Option<u32>,
    pub rate_limit: RateLimitSettings,
    pub models: Vec<String>,
    #[serde(skip)]
    pub credential_env: Option<String>,
}

impl ProviderDescriptor {
    fn from_settings(settings: &ProviderSettings, has_var: &dyn Fn(&str) -> bool) -> Self {
        let available = settings
            .credential_env
            .as_deref()
            .map(|var| has_var(var))
            .unwrap_or(true);

        Self {
            name: settings.name.clone(),
            kind: settings.kind,
            priority: settings.priority,
            available,
            max_retries: settings.max_retries,
            retry_base_ms: settings.retry_base_ms,
            timeout_ms: settings.timeout_ms,
            cost_per_page: settings.cost_per_page,
            supports_pdf: settings.supports_pdf,
            supports_image: settings.supports_image,
            supports_text: settings
                .supports_text
                .unwrap_or(settings.kind == ProviderKind::NativePdf),
            structured_extraction: settings.structured_extraction,
            supports_handwriting: settings.supports_handwriting,
            max_file_size_mb: settings.max_file_size_mb,
            max_pages: settings.max_pages,
            rate_limit: settings.rate_limit.clone(),
            models: settings.models.clone(),
            credential_env: settings.credential_env.clone(),
        }
    }

    /// True for the provider that needs no AI backend.
    pub fn is_native(&self) -> bool {
        self.kind == ProviderKind::NativePdf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A configuration finding. Reported, never thrown.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// Holds descriptors sorted by priority.
#[derive(Debug)]
pub struct ProviderRegistry {
    descriptors: RwLock<Vec<ProviderDescriptor>>,
}

impl ProviderRegistry {
    /// Build from config, resolving credentials against the process environment.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::with_env(config, credential_present)
    }

    /// Build from config with an explicit credential lookup.
    pub fn with_env(config: &ServiceConfig, has_var: impl Fn(&str) -> bool) -> Self {
        Self {
            descriptors: RwLock::new(build_descriptors(config, &has_var)),
        }
    }

    /// Replace all descriptors from a new config.
    pub fn reload(&self, config: &ServiceConfig, has_var: impl Fn(&str) -> bool) {
        let fresh = build_descriptors(config, &has_var);
        info!("Provider registry reloaded: {} providers", fresh.len());
        *self.descriptors.write().unwrap_or_else(|e| e.into_inner()) = fresh;
    }

    /// All configured providers, sorted by priority.
    pub fn all(&self) -> Vec<ProviderDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Available providers, sorted ascending by priority.
    pub fn list_available(&self) -> Vec<ProviderDescriptor> {
        self.all().into_iter().filter(|d| d.available).collect()
    }

    pub fn resolve(&self, name: &str) -> Option<ProviderDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    /// Report configuration problems.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let all = self.all();
        let available: Vec<_> = all.iter().filter(|d| d.available).collect();
        let mut diagnostics = Vec::new();

        if available.is_empty() {
            diagnostics.push(Diagnostic::error("no OCR providers are available"));
        } else if available.iter().all(|d| d.is_native()) {
            diagnostics.push(Diagnostic::warning(
                "only the no-AI fallback provider is available; scanned documents and photos cannot be processed",
            ));
        }

        for d in &all {
            if !d.available {
                if let Some(var) = &d.credential_env {
                    diagnostics.push(Diagnostic::warning(format!(
                        "{} is disabled: {} is not set",
                        d.name, var
                    )));
                }
            }
            if d.rate_limit.requests_per_minute == 0 {
                diagnostics.push(Diagnostic::error(format!(
                    "{} has requestsPerMinute = 0 and can never be called",
                    d.name
                )));
            }
            if d.timeout_ms == 0 {
                diagnostics.push(Diagnostic::error(format!("{} has a zero timeout", d.name)));
            }
            if !d.supports_pdf && !d.supports_image {
                diagnostics.push(Diagnostic::warning(format!(
                    "{} supports neither PDFs nor images",
                    d.name
                )));
            }
        }

        let mut by_priority: HashMap<u32, Vec<&str>> = HashMap::new();
        for d in &all {
            by_priority.entry(d.priority).or_default().push(&d.name);
        }
        let mut duplicates: Vec<_> = by_priority.into_iter().filter(|(_, v)| v.len() > 1).collect();
        duplicates.sort_by_key(|(p, _)| *p);
        for (priority, names) in duplicates {
            diagnostics.push(Diagnostic::warning(format!(
                "providers {} share priority {}; order between them follows config order",
                names.join(", "),
                priority
            )));
        }

        diagnostics
    }

    /// Fail fast on error-level diagnostics.
    pub fn ensure_usable(&self) -> Result<(), OcrError> {
        let mut errors = Vec::new();
        for d in self.validate() {
            match d.severity {
                Severity::Warning => warn!("Provider config: {}", d.message),
                Severity::Error => {
                    tracing::error!("Provider config: {}", d.message);
                    errors.push(d.message);
                }
            }
        }
        if self.list_available().is_empty() {
            return Err(OcrError::NoProviders);
        }
        if !errors.is_empty() {
            return Err(OcrError::Misconfigured(errors));
        }
        Ok(())
    }
}

/// True when the environment variable is set to a non-blank value.
pub fn credential_present(var: &str) -> bool {
    std::env::var(var)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn build_descriptors(config: &ServiceConfig, has_var: &dyn Fn(&str) -> bool) -> Vec<ProviderDescriptor> {
    let mut descriptors: Vec<_> = config
        .providers
        .iter()
        .map(|s| ProviderDescriptor::from_settings(s, has_var))
        .collect();
    // Stable sort keeps config order among equal priorities.
    descriptors.sort_by_key(|d| d.priority);
    descriptors
}
