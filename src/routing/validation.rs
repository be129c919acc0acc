//! Post-extraction validation and enhancement
//!
//! Checks run on every successful extraction. Each check may rewrite a field
//! into its canonical form, nudges the confidence by a bounded delta and
//! leaves a note. Validation never fails an extraction.

#![allow(clippy::cast_precision_loss)]

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationWarning;
use crate::fields::{Party, StructuredFields};

use super::patterns::parse_amount;

/// Absolute difference treated as exact for money
const CENT: f64 = 0.01;
/// Relative difference still accepted as a near match
const ARITHMETIC_TOLERANCE: f64 = 0.05;

/// Confidence deltas applied by the checks
mod delta {
    pub const REGISTRATION_VALID: f64 = 0.05;
    pub const REGISTRATION_INVALID: f64 = -0.10;
    pub const TAX_ID_VALID: f64 = 0.02;
    pub const TAX_ID_INVALID: f64 = -0.05;
    pub const DATE_INVALID: f64 = -0.05;
    pub const ARITHMETIC_EXACT: f64 = 0.05;
    pub const ARITHMETIC_CLOSE: f64 = 0.02;
    pub const ARITHMETIC_MISMATCH: f64 = -0.10;
    pub const SOURCE_FOUND: f64 = 0.02;
    pub const SOURCE_MISSING: f64 = -0.05;
}

static RE_TAX_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}[0-9A-Z]{8,12}$").expect("valid tax id regex"));
static RE_CZ_TAX_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^CZ\d{8,10}$").expect("valid czech tax id regex"));
static RE_SOURCE_AMOUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d \u{a0}.,]*\d|\d").expect("valid amount regex"));

/// Legal-form spellings and their canonical suffix
static LEGAL_FORMS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bspol\.\s*s\s*r\.\s*o\.?$", "spol. s r.o."),
        (r"(?i)\bs\.\s*r\.\s*o\.?$", "s.r.o."),
        (r"(?i)\bsro$", "s.r.o."),
        (r"(?i)\ba\.\s*s\.?$", "a.s."),
        (r"(?i)\bk\.\s*s\.?$", "k.s."),
        (r"(?i)\bv\.\s*o\.\s*s\.?$", "v.o.s."),
        (r"(?i)\bltd\.?$", "Ltd."),
        (r"(?i)\bgmbh$", "GmbH"),
        (r"(?i)\binc\.?$", "Inc."),
        (r"(?i)\bllc$", "LLC"),
    ]
    .into_iter()
    .map(|(pattern, canonical)| (Regex::new(pattern).expect("valid legal form regex"), canonical))
    .collect()
});

// ============================================================================
// Individual Checks
// ============================================================================

/// Czech company registration number (IČO) mod-11 checksum.
///
/// Shorter numbers are left-padded with zeros to eight digits.
pub fn validate_registration_id(raw: &str) -> bool {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() > 8 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let padded = format!("{:0>8}", digits);
    let values: Vec<u32> = padded.chars().filter_map(|c| c.to_digit(10)).collect();

    // weights 8..2 over the first seven digits
    let sum: u32 = values[..7]
        .iter()
        .zip((2..=8).rev())
        .map(|(d, w)| d * w)
        .sum();
    // remainder 0 gives check digit 1, remainder 1 gives 0
    let check = (11 - sum % 11) % 10;
    values[7] == check
}

/// VAT identifier format: country prefix followed by 8-12 characters.
/// Czech identifiers must be `CZ` plus 8-10 digits.
pub fn validate_tax_id(raw: &str) -> bool {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase();
    if compact.starts_with("CZ") {
        RE_CZ_TAX_ID.is_match(&compact)
    } else {
        RE_TAX_ID.is_match(&compact)
    }
}

/// Parse `DD.MM.YYYY`, `D. M. YYYY`, `DD/MM/YYYY` or `YYYY-MM-DD` into `YYYY-MM-DD`
pub fn normalize_date(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    ["%d.%m.%Y", "%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&compact, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Canonical legal-form suffix of a company name
pub fn standardize_legal_form(name: &str) -> String {
    let trimmed = name.trim().trim_end_matches([',', ';']);
    for (pattern, canonical) in LEGAL_FORMS.iter() {
        // first match wins, so "spol. s r.o." is tried before "s.r.o."
        if let Some(m) = pattern.find(trimmed) {
            let head = trimmed[..m.start()].trim_end().trim_end_matches(',');
            return if head.is_empty() {
                canonical.to_string()
            } else {
                format!("{} {}", head, canonical)
            };
        }
    }
    trimmed.to_string()
}

/// Outcome of an arithmetic comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticMatch {
    Exact,
    Close,
    Mismatch,
}

/// Compare a computed sum against the stated amount
pub fn compare_amounts(computed: f64, stated: f64) -> ArithmeticMatch {
    let diff = (computed - stated).abs();
    // epsilon absorbs float noise in summed cents
    if diff <= CENT + 1e-9 {
        return ArithmeticMatch::Exact;
    }
    let scale = computed.abs().max(stated.abs());
    if scale > 0.0 && diff / scale <= ARITHMETIC_TOLERANCE {
        ArithmeticMatch::Close
    } else {
        ArithmeticMatch::Mismatch
    }
}

fn arithmetic_delta(outcome: ArithmeticMatch) -> f64 {
    match outcome {
        ArithmeticMatch::Exact => delta::ARITHMETIC_EXACT,
        ArithmeticMatch::Close => delta::ARITHMETIC_CLOSE,
        ArithmeticMatch::Mismatch => delta::ARITHMETIC_MISMATCH,
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Result of running every check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Confidence after all deltas, clamped to [0, 1]
    pub confidence: f64,
    /// Sum of applied deltas
    pub adjustment: f64,
    pub notes: Vec<ValidationWarning>,
}

#[derive(Debug, Default)]
struct Ledger {
    adjustment: f64,
    notes: Vec<ValidationWarning>,
}

impl Ledger {
    fn record(&mut self, field: &str, delta: f64, message: impl Into<String>) {
        self.adjustment += delta;
        self.notes.push(ValidationWarning::new(field, message));
    }

    fn note(&mut self, field: &str, message: impl Into<String>) {
        self.notes.push(ValidationWarning::new(field, message));
    }
}

/// Validate and canonicalize `fields` in place against the source text
pub fn validate(fields: &mut StructuredFields, source_text: &str, confidence: f64) -> ValidationReport {
    let mut ledger = Ledger::default();

    if let Some(vendor) = fields.vendor.as_mut() {
        check_party(vendor, "vendor", &mut ledger);
    }
    if let Some(customer) = fields.customer.as_mut() {
        check_party(customer, "customer", &mut ledger);
    }

    check_date(&mut fields.date, "date", &mut ledger);
    check_date(&mut fields.due_date, "dueDate", &mut ledger);
    // currency is canonicalized silently, no confidence effect
    if let Some(currency) = fields.currency.as_mut() {
        *currency = currency.trim().to_uppercase();
    }

    check_arithmetic(fields, &mut ledger);
    cross_reference(fields, source_text, &mut ledger);

    let confidence = (confidence + ledger.adjustment).clamp(0.0, 1.0);
    tracing::debug!(
        adjustment = ledger.adjustment,
        notes = ledger.notes.len(),
        confidence,
        "Extraction validated"
    );

    ValidationReport {
        confidence,
        adjustment: ledger.adjustment,
        notes: ledger.notes,
    }
}

fn check_party(party: &mut Party, prefix: &str, ledger: &mut Ledger) {
    if let Some(id) = party.registration_id.as_mut() {
        let compact: String = id.chars().filter(|c| !c.is_whitespace()).collect();
        let field = format!("{}.registrationId", prefix);
        if validate_registration_id(&compact) {
            *id = format!("{:0>8}", compact);
            ledger.record(&field, delta::REGISTRATION_VALID, "checksum valid");
        } else {
            ledger.record(&field, delta::REGISTRATION_INVALID, format!("checksum invalid for '{}'", id));
        }
    }

    if let Some(tax_id) = party.tax_id.as_mut() {
        let field = format!("{}.taxId", prefix);
        if validate_tax_id(tax_id) {
            *tax_id = tax_id
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_uppercase();
            ledger.record(&field, delta::TAX_ID_VALID, "format valid");
        } else {
            ledger.record(&field, delta::TAX_ID_INVALID, format!("unexpected format '{}'", tax_id));
        }
    }

    if let Some(name) = party.name.as_mut() {
        let standardized = standardize_legal_form(name);
        if standardized != *name {
            ledger.note(
                &format!("{}.name", prefix),
                format!("legal form standardized from '{}'", name),
            );
            *name = standardized;
        }
    }
}

fn check_date(date: &mut Option<String>, field: &str, ledger: &mut Ledger) {
    let Some(raw) = date.as_mut() else {
        return;
    };
    match normalize_date(raw) {
        Some(normalized) => {
            if normalized != *raw {
                ledger.note(field, format!("normalized '{}' to {}", raw, normalized));
                *raw = normalized;
            }
        }
        None => ledger.record(field, delta::DATE_INVALID, format!("unrecognized date '{}'", raw)),
    }
}

fn check_arithmetic(fields: &StructuredFields, ledger: &mut Ledger) {
    let totals = fields.totals.clone().unwrap_or_default();

    let line_sum: Option<f64> = if fields.line_items.is_empty() {
        None
    } else {
        fields
            .line_items
            .iter()
            .map(crate::fields::LineItem::amount)
            // one unpriced row disables the check
            .sum::<Option<f64>>()
    };

    if let Some(sum) = line_sum {
        // line items are net when a subtotal exists, gross otherwise
        if let Some(stated) = totals.subtotal.or(totals.total) {
            let outcome = compare_amounts(sum, stated);
            ledger.record(
                "lineItems",
                arithmetic_delta(outcome),
                format!("line items sum {:.2} vs stated {:.2}: {:?}", sum, stated, outcome),
            );
        }
    }

    if let (Some(subtotal), Some(vat), Some(total)) = (totals.subtotal, totals.vat_amount, totals.total) {
        let outcome = compare_amounts(subtotal + vat, total);
        ledger.record(
            "totals",
            arithmetic_delta(outcome),
            format!("subtotal + VAT {:.2} vs total {:.2}: {:?}", subtotal + vat, total, outcome),
        );
    }
}

fn cross_reference(fields: &StructuredFields, source_text: &str, ledger: &mut Ledger) {
    if source_text.trim().is_empty() {
        return;
    }

    // separators differ between OCR and model output
    if let Some(number) = fields.invoice_number.as_deref() {
        let found = alnum_upper(source_text).contains(&alnum_upper(number));
        record_presence(ledger, "invoiceNumber", found);
    }

    if let Some(name) = fields.vendor_name() {
        let lower = source_text.to_lowercase();
        // first distinctive word, legal forms rarely survive OCR intact
        let key_word = name
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .find(|w| w.chars().count() >= 3);
        if let Some(word) = key_word {
            record_presence(ledger, "vendor.name", lower.contains(&word));
        }
    }

    if let Some(amount) = fields.amount() {
        record_presence(ledger, "totals", source_contains_amount(source_text, amount));
    }
}

fn record_presence(ledger: &mut Ledger, field: &str, found: bool) {
    if found {
        ledger.record(field, delta::SOURCE_FOUND, "confirmed in source text");
    } else {
        ledger.record(field, delta::SOURCE_MISSING, "not found in source text");
    }
}

fn alnum_upper(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

fn source_contains_amount(source: &str, amount: f64) -> bool {
    let matches_amount = |raw: &str| parse_amount(raw).is_some_and(|v| (v - amount).abs() <= CENT);
    // grouped numbers first, then bare tokens glued to currency symbols
    RE_SOURCE_AMOUNT
        .find_iter(source)
        .any(|m| matches_amount(m.as_str()))
        || source
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_ascii_digit()))
            .any(matches_amount)
}
