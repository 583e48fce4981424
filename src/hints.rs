//! Booking field hints from accepted OCR text.
//!
//! Pure functions over compiled regex patterns. Runs only after a provider's
//! text has passed the quality gate; provider-supplied structured fields take
//! precedence over anything found here.

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Fields a downstream reservation parser cannot do without.
pub const CORE_FIELDS: &[&str] = &["checkIn", "checkOut", "guestName", "totalAmount"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Normalize {
    None,
    Uppercase,
    Lowercase,
    IsoDate,
    Integer,
    Amount,
    Currency,
    Platform,
    Phone,
}

/// Field patterns in priority order; the first match for a field wins.
const FIELD_PATTERNS: &[(&str, &str, Normalize)] = &[
    (
        "confirmationCode",
        r"(?i:confirmation|booking|reservation|localizador|c[oó]digo)\s*(?i:code|number|no\.?|#|id)?\s*[:#]?\s*([A-Z0-9]{5,12})\b",
        Normalize::Uppercase,
    ),
    (
        "checkIn",
        r"(?i)\b(?:check[\s-]?in|arrival|entrada)(?:\s+date)?\s*:?\s*(\d{4}-\d{2}-\d{2}|\d{1,2}[/.]\d{1,2}[/.]\d{4})",
        Normalize::IsoDate,
    ),
    (
        "checkOut",
        r"(?i)\b(?:check[\s-]?out|departure|sa[ií]da)(?:\s+date)?\s*:?\s*(\d{4}-\d{2}-\d{2}|\d{1,2}[/.]\d{1,2}[/.]\d{4})",
        Normalize::IsoDate,
    ),
    (
        "guestName",
        r"(?m)^\s*(?i:guest(?:\s+name)?|name|h[oó]spede|booked\s+by)\s*:\s*(\p{Lu}[\p{L}'-]+(?:[ \t]+\p{Lu}[\p{L}'-]+){0,3})",
        Normalize::None,
    ),
    (
        "guestCount",
        r"(?i)\b(?:guests?|h[oó]spedes|adults?)\s*:\s*(\d{1,2})\b",
        Normalize::Integer,
    ),
    (
        "guestCount",
        r"(?i)\b(\d{1,2})\s+(?:guests?|adults?|people|persons|h[oó]spedes)\b",
        Normalize::Integer,
    ),
    (
        "totalAmount",
        r"(?i)\b(?:grand\s+total|total(?:\s+amount)?|amount\s+paid|valor\s+total)[^\d\n]{0,20}?(\d[\d.,]*\d|\d)",
        Normalize::Amount,
    ),
    (
        "currency",
        r"(?i)(R\$|€|£|\$|\b(?:EUR|USD|GBP|BRL)\b)",
        Normalize::Currency,
    ),
    (
        "platform",
        r"(?i)\b(airbnb|booking\.com|vrbo|expedia|agoda|hotels\.com)\b",
        Normalize::Platform,
    ),
    (
        "email",
        r"\b([A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,})\b",
        Normalize::Lowercase,
    ),
    ("phone", r"(\+\d[\d\s().-]{7,}\d)", Normalize::Phone),
];

/// Extracted fields plus the core fields that are still absent.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingHints {
    pub fields: Map<String, Value>,
    pub missing_fields: Vec<String>,
}

struct CompiledField {
    field: &'static str,
    regex: Regex,
    normalize: Normalize,
}

pub struct HintExtractor {
    patterns: Vec<CompiledField>,
}

impl HintExtractor {
    /// Compile the field patterns. Skips invalid regexes with a warning.
    pub fn new() -> Self {
        let mut patterns = Vec::new();
        for (field, pattern, normalize) in FIELD_PATTERNS {
            match Regex::new(pattern) {
                Ok(regex) => patterns.push(CompiledField {
                    field: *field,
                    regex,
                    normalize: *normalize,
                }),
                Err(e) => warn!("Skipping invalid hint pattern for '{}': {}", field, e),
            }
        }
        debug!("Compiled {} hint patterns", patterns.len());
        Self { patterns }
    }

    /// Regex pass over `text`, merged under the provider's own fields.
    pub fn hints(&self, text: &str, provider_fields: Option<&Value>) -> BookingHints {
        let mut fields = self.extract(text);
        if let Some(Value::Object(provided)) = provider_fields {
            for (key, value) in provided {
                if is_present(value) {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        let missing_fields = missing_fields(&fields);
        BookingHints {
            fields,
            missing_fields,
        }
    }

    /// First normalised match per field.
    pub fn extract(&self, text: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        for pattern in &self.patterns {
            if fields.contains_key(pattern.field) {
                continue;
            }
            let raw = pattern
                .regex
                .captures(text)
                .and_then(|cap| cap.get(1).or_else(|| cap.get(0)))
                .map(|m| m.as_str().trim());
            if let Some(value) = raw.and_then(|r| normalize_value(r, pattern.normalize)) {
                fields.insert(pattern.field.to_string(), value);
            }
        }
        fields
    }
}

impl Default for HintExtractor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn missing_fields(fields: &Map<String, Value>) -> Vec<String> {
    CORE_FIELDS
        .iter()
        .filter(|f| !fields.get(**f).map(is_present).unwrap_or(false))
        .map(|f| f.to_string())
        .collect()
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn normalize_value(raw: &str, normalize: Normalize) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    let value = match normalize {
        Normalize::None => json!(raw),
        Normalize::Uppercase => json!(raw.to_uppercase()),
        Normalize::Lowercase => json!(raw.to_lowercase()),
        Normalize::IsoDate => Value::String(iso_date(raw)?),
        Normalize::Integer => Value::from(raw.parse::<u32>().ok()?),
        Normalize::Amount => Value::from(parse_amount(raw)?),
        Normalize::Currency => {
            let code = match raw.to_uppercase().as_str() {
                "€" | "EUR" => "EUR",
                "$" | "USD" => "USD",
                "£" | "GBP" => "GBP",
                "R$" | "BRL" => "BRL",
                _ => return None,
            };
            json!(code)
        }
        Normalize::Platform => {
            let name = match raw.to_lowercase().as_str() {
                "airbnb" => "Airbnb",
                "booking.com" => "Booking.com",
                "vrbo" => "Vrbo",
                "expedia" => "Expedia",
                "agoda" => "Agoda",
                "hotels.com" => "Hotels.com",
                _ => return None,
            };
            json!(name)
        }
        Normalize::Phone => {
            let digits: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '+')
                .collect();
            json!(digits)
        }
    };
    Some(value)
}

/// `YYYY-MM-DD` from ISO or day-first `DD/MM/YYYY` / `DD.MM.YYYY`.
fn iso_date(raw: &str) -> Option<String> {
    if raw.len() == 10 && raw.as_bytes()[4] == b'-' {
        return Some(raw.to_string());
    }
    let parts: Vec<&str> = raw.split(|c: char| c == '/' || c == '.').collect();
    if parts.len() != 3 {
        return None;
    }
    let day: u32 = parts[0].parse().ok()?;
    let month: u32 = parts[1].parse().ok()?;
    let year: u32 = parts[2].parse().ok()?;
    // Month-first only when the middle number cannot be a month.
    let (day, month) = if month > 12 && day <= 12 {
        (month, day)
    } else {
        (day, month)
    };
    if !(1..=31).contains(&day) || !(1..=12).contains(&month) {
        return None;
    }
    Some(format!("{:04}-{:02}-{:02}", year, month, day))
}

/// Parse `1.234,56`, `1,234.56`, `540.00` or `540` into a number.
fn parse_amount(raw: &str) -> Option<f64> {
    let last_dot = raw.rfind('.');
    let last_comma = raw.rfind(',');
    let decimal = match (last_dot, last_comma) {
        (Some(d), Some(c)) => Some(if d > c { '.' } else { ',' }),
        // A lone separator followed by exactly three digits groups thousands.
        (Some(d), None) => {
            (raw.matches('.').count() == 1 && raw.len() - d - 1 != 3).then_some('.')
        }
        (None, Some(c)) => {
            (raw.matches(',').count() == 1 && raw.len() - c - 1 != 3).then_some(',')
        }
        (None, None) => None,
    };
    let cleaned: String = raw
        .chars()
        .filter_map(|c| match c {
            '0'..='9' => Some(c),
            c if Some(c) == decimal => Some('.'),
            _ => None,
        })
        .collect();
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIRMATION: &str = "Booking confirmation HMXY42\n\
        Guest: Maria Santos\n\
        2 adults\n\
        Check-in: 2024-05-01\n\
        Check-out: 05/05/2024\n\
        Total: €1.080,50 paid via Airbnb\n\
        Contact: Maria.Santos@Example.com, +351 912 345 678";

    #[test]
    fn test_extracts_booking_fields() {
        let fields = HintExtractor::new().extract(CONFIRMATION);
        assert_eq!(fields["confirmationCode"], "HMXY42");
        assert_eq!(fields["guestName"], "Maria Santos");
        assert_eq!(fields["guestCount"], 2);
        assert_eq!(fields["checkIn"], "2024-05-01");
        assert_eq!(fields["checkOut"], "2024-05-05");
        assert_eq!(fields["totalAmount"], 1080.5);
        assert_eq!(fields["currency"], "EUR");
        assert_eq!(fields["platform"], "Airbnb");
        assert_eq!(fields["email"], "maria.santos@example.com");
        assert_eq!(fields["phone"], "+351912345678");
    }

    #[test]
    fn test_missing_core_fields() {
        let hints = HintExtractor::new().hints("Check-in: 2024-05-01 at the lake house", None);
        assert_eq!(hints.fields["checkIn"], "2024-05-01");
        assert_eq!(hints.missing_fields, vec!["checkOut", "guestName", "totalAmount"]);
    }

    #[test]
    fn test_provider_fields_win() {
        let provider = json!({
            "guestName": "Maria S. Santos",
            "checkOut": null,
            "totalAmount": 1080.5,
        });
        let hints = HintExtractor::new().hints(CONFIRMATION, Some(&provider));
        assert_eq!(hints.fields["guestName"], "Maria S. Santos");
        // Null from the provider does not erase a regex hit.
        assert_eq!(hints.fields["checkOut"], "2024-05-05");
        assert!(hints.missing_fields.is_empty());
    }

    #[test]
    fn test_amount_formats() {
        assert_eq!(parse_amount("540.00"), Some(540.0));
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("1.234"), Some(1234.0));
        assert_eq!(parse_amount("99,5"), Some(99.5));
        assert_eq!(parse_amount("540"), Some(540.0));
    }

    #[test]
    fn test_dates() {
        assert_eq!(iso_date("2024-05-01").as_deref(), Some("2024-05-01"));
        assert_eq!(iso_date("01.05.2024").as_deref(), Some("2024-05-01"));
        assert_eq!(iso_date("05/31/2024").as_deref(), Some("2024-05-31"));
        assert_eq!(iso_date("40/40/2024"), None);
    }
}
