//! Cheap handwriting heuristic.
//!
//! Scores a document 0-1 from its embedded text (if any). Printed booking
//! confirmations carry a dense text layer with `Label: value` lines and
//! tables; photos and handwritten notes carry little or none. The score only
//! reorders providers, it never blocks processing.

use crate::config::DEFAULT_ORDINARY_PUNCTUATION;
use crate::ocr::native::extract_pdf_text;
use crate::ocr::{Document, DocumentKind};
use crate::quality::artifact_ratio;

const DENSITY_WEIGHT: f32 = 0.35;
const NOISE_WEIGHT: f32 = 0.25;
const STRUCTURE_WEIGHT: f32 = 0.25;
const VARIANCE_WEIGHT: f32 = 0.15;

/// Characters of text at which a document counts as text-dense.
const DENSE_TEXT_CHARS: f32 = 400.0;

#[derive(Debug, Clone, Copy)]
pub struct HandwritingDetector {
    threshold: f32,
}

impl HandwritingDetector {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Likelihood in `[0, 1]` that the document is handwritten or image-only.
    pub fn score(&self, document: &Document) -> f32 {
        let sample = match document.kind() {
            DocumentKind::Pdf => extract_pdf_text(&document.data)
                .map(|(text, _)| text)
                .unwrap_or_default(),
            DocumentKind::Text => String::from_utf8_lossy(&document.data).to_string(),
            DocumentKind::Image => String::new(),
        };
        score_text(&sample)
    }

    pub fn prefers_handwriting_provider(&self, score: f32) -> bool {
        score > self.threshold
    }
}

/// Combine density, noise, structure and word-length signals.
pub fn score_text(text: &str) -> f32 {
    let trimmed = text.trim();
    let chars = trimmed.chars().count() as f32;

    let density = 1.0 - (chars / DENSE_TEXT_CHARS).min(1.0);
    let noise = (artifact_ratio(trimmed, DEFAULT_ORDINARY_PUNCTUATION) as f32 / 0.2).min(1.0);
    let structure = 1.0 - (structure_markers(trimmed) as f32 / 3.0).min(1.0);
    let variance = (word_length_variance(trimmed) / 16.0).min(1.0);

    let score = DENSITY_WEIGHT * density
        + NOISE_WEIGHT * noise
        + STRUCTURE_WEIGHT * structure
        + VARIANCE_WEIGHT * variance;
    score.clamp(0.0, 1.0)
}

/// Count `Label: value` lines, table rows and full sentences.
fn structure_markers(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let line = line.trim();
            if line.is_empty() {
                return false;
            }
            let labelled = line
                .split_once(':')
                .map(|(label, value)| {
                    let label = label.trim();
                    (2..=30).contains(&label.len())
                        && label.chars().any(|c| c.is_alphabetic())
                        && !value.trim().is_empty()
                })
                .unwrap_or(false);
            let tabular = line.matches('|').count() >= 2 || line.contains('\t') || line.contains("   ");
            let sentence = line.len() >= 60 && line.ends_with('.');
            labelled || tabular || sentence
        })
        .count()
}

fn word_length_variance(text: &str) -> f32 {
    let lengths: Vec<f32> = text
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).count() as f32)
        .filter(|len| *len > 0.0)
        .collect();
    if lengths.len() < 3 {
        return 0.0;
    }
    let mean = lengths.iter().sum::<f32>() / lengths.len() as f32;
    lengths.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / lengths.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::native::fixture_pdf;

    #[test]
    fn test_photo_without_text_scores_high() {
        let detector = HandwritingDetector::new(0.4);
        let photo = Document::new("note.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF, 0xE0]);
        let score = detector.score(&photo);
        assert!(score > 0.4, "score {}", score);
        assert!(detector.prefers_handwriting_provider(score));
    }

    #[test]
    fn test_printed_confirmation_scores_low() {
        let detector = HandwritingDetector::new(0.4);
        let pdf = fixture_pdf(&[
            "Booking confirmation",
            "Guest: Maria Santos",
            "Check-in: 2024-05-01",
            "Check-out: 2024-05-05",
            "Total: EUR 540.00",
        ]);
        let doc = Document::new("booking.pdf", "application/pdf", pdf);
        let score = detector.score(&doc);
        assert!(score < 0.4, "score {}", score);
        assert!(!detector.prefers_handwriting_provider(score));
    }

    #[test]
    fn test_score_bounds() {
        for text in ["", "a", "~~~~ §§§ ¦¦¦", "Guest: A\nTotal: 3\n| a | b |"] {
            let s = score_text(text);
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_structure_markers() {
        let text = "Guest: Ana\nno label here\n| Night | Rate |\nWe look forward to welcoming you at the property next month.";
        assert_eq!(structure_markers(text), 3);
    }

    #[test]
    fn test_fragmented_words_raise_variance() {
        let even = word_length_variance("book room stay cost date");
        let ragged = word_length_variance("a bb cccccccccccccccc d eeeeeeeeeeeeeee f");
        assert!(ragged > even);
    }
}
