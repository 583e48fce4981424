//! Quality gate for OCR output.
//!
//! Scores text against a 100-point baseline. Each failed check subtracts its
//! configured penalty; acceptance requires the configured minimum score and
//! a minimum amount of usable text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::QualityConfig;
use crate::ocr::OcrResult;

/// Booking-document markers. A real confirmation usually hits several.
const DOMAIN_INDICATORS: &[(&str, &str)] = &[
    ("checkIn", r"(?i)\b(check[\s-]?in|arrival|arriving|entrada)\b"),
    ("checkOut", r"(?i)\b(check[\s-]?out|departure|departing|sa[ií]da)\b"),
    ("guest", r"(?i)\b(guests?|h[oó]spedes?|adults?|travell?ers?)\b"),
    (
        "date",
        r"(?i)\b(\d{4}-\d{2}-\d{2}|\d{1,2}[/.]\d{1,2}[/.]\d{2,4}|\d{1,2}\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{4})\b",
    ),
    (
        "currency",
        r"(?i)([€$£]\s?\d|\b(eur|usd|gbp|brl)\s?\d|R\$\s?\d|\d\s?(€|eur\b|usd\b|gbp\b))",
    ),
    (
        "platform",
        r"(?i)\b(airbnb|booking\.com|vrbo|expedia|homeaway|hotels\.com|agoda)\b",
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub quality_score: u8,
    pub issues: Vec<String>,
    pub corrections: Vec<String>,
}

pub struct QualityValidator {
    config: QualityConfig,
    indicators: Vec<(&'static str, Regex)>,
}

impl QualityValidator {
    pub fn new(config: QualityConfig) -> Self {
        let indicators = DOMAIN_INDICATORS
            .iter()
            .filter_map(|(name, pattern)| match Regex::new(pattern) {
                Ok(regex) => Some((*name, regex)),
                Err(e) => {
                    warn!("Skipping invalid indicator pattern '{}': {}", name, e);
                    None
                }
            })
            .collect();
        Self { config, indicators }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn validate(&self, result: &OcrResult) -> ValidationResult {
        self.validate_text(&result.text, result.confidence)
    }

    /// Score raw text and a confidence without any provider involved.
    pub fn validate_text(&self, text: &str, confidence: f64) -> ValidationResult {
        let cfg = &self.config;
        let trimmed = text.trim();
        let length = trimmed.chars().count();
        let mut score: i32 = 100;
        let mut issues = Vec::new();
        let mut corrections = Vec::new();

        if length < cfg.min_text_length {
            score -= cfg.short_text_penalty as i32;
            issues.push(format!(
                "Text is very short ({} chars, expected at least {}); extraction may have failed",
                length, cfg.min_text_length
            ));
            corrections.push("Rescan the document at a higher resolution".to_string());
        }

        let ratio = artifact_ratio(trimmed, &cfg.ordinary_punctuation);
        if ratio > cfg.max_artifact_ratio {
            score -= cfg.artifact_penalty as i32;
            issues.push(format!(
                "High artifact density ({:.1}% of characters)",
                ratio * 100.0
            ));
            corrections.push("Strip non-text artifacts before parsing".to_string());
        }

        let found = self.domain_indicators(trimmed);
        if found.len() < cfg.min_domain_indicators {
            score -= cfg.indicator_penalty as i32;
            issues.push(format!(
                "Only {} booking indicator(s) found ({}), expected at least {}",
                found.len(),
                if found.is_empty() { "none".to_string() } else { found.join(", ") },
                cfg.min_domain_indicators
            ));
            corrections.push("Confirm the document is a booking confirmation".to_string());
        }

        if confidence < cfg.min_confidence {
            score -= cfg.confidence_penalty as i32;
            issues.push(format!(
                "Provider confidence {:.2} is below {:.2}",
                confidence, cfg.min_confidence
            ));
            corrections.push("Retry with a provider better suited to this document".to_string());
        }

        let quality_score = score.clamp(0, 100) as u8;
        ValidationResult {
            is_valid: quality_score >= cfg.accept_score && length >= cfg.usable_text_length,
            quality_score,
            issues,
            corrections,
        }
    }

    /// Names of the booking indicators present in `text`.
    pub fn domain_indicators(&self, text: &str) -> Vec<&'static str> {
        self.indicators
            .iter()
            .filter(|(_, regex)| regex.is_match(text))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Label a confidence using the configured bands.
    pub fn quality_tier(&self, confidence: f64) -> &'static str {
        let bands = &self.config.bands;
        if confidence >= bands.good {
            "good"
        } else if confidence >= bands.warning {
            "acceptable"
        } else if confidence >= bands.minimum {
            "poor"
        } else {
            "unreliable"
        }
    }
}

/// Share of characters that are neither word characters, whitespace, nor
/// one of `ordinary`.
pub fn artifact_ratio(text: &str, ordinary: &str) -> f64 {
    let mut total = 0usize;
    let mut artifacts = 0usize;
    for c in text.chars() {
        total += 1;
        if !(c.is_alphanumeric() || c.is_whitespace() || ordinary.contains(c)) {
            artifacts += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        artifacts as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ORDINARY_PUNCTUATION;

    fn validator() -> QualityValidator {
        QualityValidator::new(QualityConfig::default())
    }

    const GOOD_TEXT: &str = "Booking confirmation HMXY42\n\
        Guest: Maria Santos, 2 adults\n\
        Check-in: 2024-05-01\n\
        Check-out: 2024-05-05\n\
        Total: €540.00 via Airbnb";

    #[test]
    fn test_clean_booking_text_scores_full() {
        let v = validator().validate_text(GOOD_TEXT, 0.95);
        assert!(v.is_valid);
        assert_eq!(v.quality_score, 100);
        assert!(v.issues.is_empty());
    }

    #[test]
    fn test_check_in_out_lines_pass_the_gate() {
        let text = "Your stay is confirmed.\nCheck-in: 2024-05-01\nCheck-out: 2024-05-05\n";
        assert!(text.trim().chars().count() >= 50);
        let v = validator().validate_text(text, 0.9);
        assert!(v.is_valid);
        assert!(v.quality_score >= 60);
    }

    #[test]
    fn test_short_text_rejected() {
        let v = validator().validate_text("Check-in 2024", 0.95);
        assert!(v.quality_score < 100);
        assert!(v.issues[0].contains("very short"));
        let tiny = validator().validate_text("abc", 0.99);
        assert!(!tiny.is_valid);
    }

    #[test]
    fn test_garbage_accumulates_penalties() {
        let garbage = "¦¦§§ ~~^^ {{}} <<>> ¤¤ \u{FFFD}\u{FFFD} lorem ipsum dolor sit amet consectetur";
        let v = validator().validate_text(garbage, 0.5);
        assert!(!v.is_valid);
        assert_eq!(v.quality_score, 100 - 20 - 20 - 15);
        assert_eq!(v.issues.len(), 3);
        assert_eq!(v.corrections.len(), 3);
    }

    #[test]
    fn test_score_is_monotonic_in_confidence() {
        let v = validator();
        let low = v.validate_text(GOOD_TEXT, 0.3).quality_score;
        let high = v.validate_text(GOOD_TEXT, 0.9).quality_score;
        assert!(high >= low);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let strict = QualityValidator::new(QualityConfig {
            accept_score: 90,
            ..QualityConfig::default()
        });
        let text = "Check-in: 2024-05-01 Check-out: 2024-05-05 at the lake house, booked for two";
        assert!(validator().validate_text(text, 0.7).is_valid);
        assert!(!strict.validate_text(text, 0.7).is_valid);
    }

    #[test]
    fn test_indicators_and_punctuation() {
        let v = validator();
        let found = v.domain_indicators(GOOD_TEXT);
        for name in ["checkIn", "checkOut", "guest", "date", "currency", "platform"] {
            assert!(found.contains(&name), "missing {}", name);
        }
        assert_eq!(
            artifact_ratio("Check-in: 01/05/2024 (late), €120", DEFAULT_ORDINARY_PUNCTUATION),
            0.0
        );
        assert!(artifact_ratio("~~~~a", DEFAULT_ORDINARY_PUNCTUATION) > 0.5);
    }

    #[test]
    fn test_ordinary_punctuation_is_configurable() {
        let text = "Booking HMXY42 ~~ Check-in: 2024-05-01 ~~ Check-out: 2024-05-05 ~~ Guest: Maria ~~ €540";
        let default = validator().validate_text(text, 0.95);
        assert!(default.issues.iter().any(|i| i.contains("artifact density")));

        let tilde_ok = QualityValidator::new(QualityConfig {
            ordinary_punctuation: format!("{}~", DEFAULT_ORDINARY_PUNCTUATION),
            ..QualityConfig::default()
        });
        let relaxed = tilde_ok.validate_text(text, 0.95);
        assert!(relaxed.issues.iter().all(|i| !i.contains("artifact density")));
        assert!(relaxed.quality_score > default.quality_score);
    }

    #[test]
    fn test_quality_tiers() {
        let v = validator();
        assert_eq!(v.quality_tier(0.95), "good");
        assert_eq!(v.quality_tier(0.85), "acceptable");
        assert_eq!(v.quality_tier(0.65), "poor");
        assert_eq!(v.quality_tier(0.2), "unreliable");
    }
}
