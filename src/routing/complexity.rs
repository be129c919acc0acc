//! Document complexity assessment
//!
//! Scores recognised text on a handful of structural signals and buckets it
//! as simple, medium or complex. The bucket steers tier selection (complex
//! documents weigh reasoning higher) and is part of the cache key.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::patterns::line_items;

const SIMPLE_MAX_SCORE: u32 = 2;
const MEDIUM_MAX_SCORE: u32 = 5;

static RE_VAT_RATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})\s?%").expect("valid vat rate regex"));
static RE_POSTAL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}\s?\d{2}\b").expect("valid postal code regex"));
static RE_STREET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ulice|street|st\.|náměstí|nám\.|třída|road|avenue)\b").expect("valid street regex")
});

const PAYMENT_TERMS: &[&str] = &[
    "iban",
    "swift",
    "bic",
    "variabilní symbol",
    "variable symbol",
    "konstantní symbol",
    "specifický symbol",
    "bankovní účet",
    "bank account",
    "splatnost",
    "due date",
];

const SPECIAL_CASES: &[&str] = &[
    "reverse charge",
    "přenesení daňové povinnosti",
    "zálohová",
    "dobropis",
    "credit note",
    "opravný",
    "exchange rate",
    "kurz",
    "intra-community",
    "osvobozeno",
];

/// Czech-specific letters, used to tell Czech text from other Latin scripts
const CZECH_LETTERS: &[char] = &['ě', 'š', 'č', 'ř', 'ž', 'ů', 'ň', 'ť', 'ď'];

// ============================================================================
// Assessment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityBucket {
    Simple,
    Medium,
    Complex,
}

impl ComplexityBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }
}

impl std::fmt::Display for ComplexityBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals behind a complexity bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityAssessment {
    pub bucket: ComplexityBucket,
    pub score: u32,
    pub line_items: usize,
    pub vat_rates: usize,
    pub address_signals: usize,
    pub payment_fields: usize,
    pub special_cases: Vec<String>,
    pub length: usize,
}

/// Assess the complexity of recognised text
pub fn assess(text: &str) -> ComplexityAssessment {
    let lower = text.to_lowercase();

    let line_items = line_items(text).len();
    let vat_rates = RE_VAT_RATE
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
        .collect::<BTreeSet<_>>()
        .len();
    let address_signals = RE_POSTAL_CODE.find_iter(text).count() + RE_STREET.find_iter(text).count();
    let payment_fields = PAYMENT_TERMS.iter().filter(|t| lower.contains(*t)).count();
    let special_cases: Vec<String> = SPECIAL_CASES
        .iter()
        .filter(|t| lower.contains(*t))
        .map(|t| (*t).to_string())
        .collect();
    let length = text.chars().count();

    let mut score = 0;
    score += match line_items {
        0 => 0,
        1..=3 => 1,
        4..=10 => 2,
        _ => 3,
    };
    // mixed rates mean per-row VAT bookkeeping
    if vat_rates > 1 {
        score += 2;
    }
    // one address is expected, a second means delivery or branch details
    if address_signals >= 2 {
        score += 1;
    }
    if payment_fields >= 3 {
        score += 1;
    }
    // reverse charge, advances, credit notes...
    score += (2 * special_cases.len() as u32).min(3);
    score += match length {
        0..=1500 => 0,
        1501..=3000 => 1,
        _ => 2,
    };

    let bucket = if score <= SIMPLE_MAX_SCORE {
        ComplexityBucket::Simple
    } else if score <= MEDIUM_MAX_SCORE {
        ComplexityBucket::Medium
    } else {
        ComplexityBucket::Complex
    };

    ComplexityAssessment {
        bucket,
        score,
        line_items,
        vat_rates,
        address_signals,
        payment_fields,
        special_cases,
        length,
    }
}

/// Whether the text appears to be written in the target language.
///
/// Only Czech is detected positively (by its diacritics); for any other
/// target the text is assumed to match.
pub fn is_target_language(text: &str, target_language: &str) -> bool {
    match target_language.to_lowercase().as_str() {
        "cs" | "cz" | "ces" | "czech" => {
            let hits = text
                .to_lowercase()
                .chars()
                .filter(|c| CZECH_LETTERS.contains(c))
                .count();
            hits >= 3
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_receipt_is_simple() {
        let assessment = assess("Receipt\nCoffee 1 45 45\nTotal 45 CZK");
        assert_eq!(assessment.bucket, ComplexityBucket::Simple);
        assert_eq!(assessment.line_items, 1);
    }

    #[test]
    fn test_multi_rate_reverse_charge_is_complex() {
        let mut text = String::from(
            "Faktura 2024001\nDodavatel: ACME s.r.o., Hlavní ulice 12, 110 00 Praha\n\
             Odběratel: Beta GmbH, Main street 5, 101 15 Berlin\n\
             Reverse charge - přenesení daňové povinnosti\n\
             IBAN CZ65 0800 0000 1920 0014 5399, SWIFT GIBACZPX, variabilní symbol 2024001\n\
             DPH 21 % 315, DPH 12 % 60\n",
        );
        for i in 0..12 {
            text.push_str(&format!("Item {} 2 100 200\n", i));
        }
        let assessment = assess(&text);
        assert!(assessment.vat_rates >= 2);
        assert!(assessment.line_items > 10);
        assert!(!assessment.special_cases.is_empty());
        assert_eq!(assessment.bucket, ComplexityBucket::Complex);
    }

    #[test]
    fn test_medium_document() {
        let text = "Invoice 2024001\nWidget 2 100 200\nGadget 1 300 300\nBolt 10 5 50\nNut 10 2 20\n\
                    VAT 21 % and 12 %\nTotal 570 EUR";
        let assessment = assess(text);
        assert_eq!(assessment.bucket, ComplexityBucket::Medium);
    }

    #[test]
    fn test_target_language() {
        assert!(is_target_language("Faktura - daňový doklad, dodavatel Říčany, účet", "cs"));
        assert!(!is_target_language("Invoice from ACME Ltd, total due", "cs"));
        assert!(is_target_language("Invoice from ACME Ltd", "en"));
    }
}
