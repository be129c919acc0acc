//! Pattern-based field extraction
//!
//! A local, model-free extractor built from regular expressions. It fills the
//! `structured_fields` of every recognition result and serves as the last
//! tier of every fallback chain, so it must never fail: missing fields simply
//! stay `None`.

#![allow(clippy::cast_precision_loss)]

use std::sync::LazyLock;

use regex::Regex;

use crate::fields::{DocumentType, LineItem, Party, StructuredFields, Totals};

/// Confidence range of the pattern extractor
pub const MIN_PATTERN_CONFIDENCE: f64 = 0.3;
pub const MAX_PATTERN_CONFIDENCE: f64 = 0.85;

const AMOUNT: &str = r"(-?\d[\d \u{a0}.,]*\d|\d)";
const DATE: &str = r"(\d{1,2}\.\s?\d{1,2}\.\s?\d{4}|\d{4}-\d{2}-\d{2})";

static RE_INVOICE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:invoice|faktura|doklad)\s*(?:no\.?|number|č\.|číslo|#)?\s*[:#]?\s*([A-Z]{0,6}[0-9][A-Z0-9/\-]{1,})",
    )
    .expect("valid invoice number regex")
});
static RE_VARIABLE_SYMBOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:variabilní\s+symbol|variable\s+symbol|var\.\s*symbol|\bVS\b)\s*[:.]?\s*(\d{1,10})\b")
        .expect("valid variable symbol regex")
});
static RE_DUE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:due\s+date|datum\s+splatnosti|splatnost|payable\s+by)\s*[:.]?\s*{}",
        DATE
    ))
    .expect("valid due date regex")
});
static RE_ISSUE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:date\s+of\s+issue|issue\s+date|invoice\s+date|datum\s+vystavení|\bdate\b|\bdatum\b)\s*[:.]?\s*{}",
        DATE
    ))
    .expect("valid issue date regex")
});
static RE_ANY_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b{}", DATE)).expect("valid date regex"));
static RE_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:\btotal\b(?:\s+due|\s+amount)?|celkem(?:\s+k\s+úhradě)?|k\s+úhradě|amount\s+due|to\s+pay)\s*[:.]?\s*(?:[A-Z]{{3}}\s*)?{}",
        AMOUNT
    ))
    .expect("valid total regex")
});
static RE_SUBTOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:subtotal|základ(?:\s+daně)?|tax\s+base|net\s+amount)\s*[:.]?\s*(?:[A-Z]{{3}}\s*)?{}",
        AMOUNT
    ))
    .expect("valid subtotal regex")
});
static RE_VAT_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:\bvat\b|\bdph\b)(?:\s+amount|\s+celkem)?\s*(?:\d{{1,2}}\s*%)?\s*[:.]?\s*(?:[A-Z]{{3}}\s*)?{}",
        AMOUNT
    ))
    .expect("valid vat regex")
});
static RE_CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(CZK|EUR|USD|GBP|PLN|HUF|CHF)\b|(Kč|€|\$|£)").expect("valid currency regex")
});
static RE_REGISTRATION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bIČO?\b|\bICO\b|\bIČ:|reg(?:istration)?\.?\s*(?:no\.?|number)|company\s+id)\s*[:.]?\s*(\d{8})\b")
        .expect("valid registration id regex")
});
static RE_TAX_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:DIČ|\bDIC\b|VAT\s*(?:ID|No\.?|number|reg\.?\s*no\.?))\s*[:.]?\s*([A-Z]{2}\d{8,10})\b")
        .expect("valid tax id regex")
});
static RE_BANK_ACCOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:bank\s+account|bankovní\s+účet|účet|account|iban)\s*(?:no\.?|number|č\.)?\s*[:.]?\s*([A-Z]{2}\d{2}(?: ?[A-Z0-9]{4}){3,7}(?: ?[A-Z0-9]{1,4})?|(?:\d{1,6}-)?\d{2,10}/\d{4})",
    )
    .expect("valid bank account regex")
});
static RE_VENDOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:supplier|vendor|dodavatel|seller|from)\s*:?\s*(\S[^\n]{1,79})$")
        .expect("valid vendor regex")
});
static RE_CUSTOMER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:customer|odběratel|buyer|bill\s+to)\s*:?\s*(\S[^\n]{1,79})$")
        .expect("valid customer regex")
});
static RE_LEGAL_FORM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*([^\n]{2,60}?\b(?:s\.\s?r\.\s?o\.|a\.\s?s\.|spol\.|ltd\.?|gmbh|inc\.?|llc|k\.\s?s\.|v\.\s?o\.\s?s\.))\s*$")
        .expect("valid legal form regex")
});
static RE_LINE_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*([^\d\n][^\n]*?)\s+(\d+(?:[.,]\d+)?)\s*(?:ks|pcs|x|h|kg|m)?\s+(\d+(?:[.,]\d{1,2})?)\s+(\d+(?:[.,]\d{1,2})?)\s*$",
    )
    .expect("valid line item regex")
});

/// Parse a localized amount such as `1 500,00`, `1,500.00` or `1.500`
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');

    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(c), None) => {
            // a lone comma is a thousands separator only before exactly three digits
            let decimals = cleaned.len() - c - 1;
            if cleaned.matches(',').count() == 1 && decimals != 3 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (None, Some(d)) => {
            let decimals = cleaned.len() - d - 1;
            if cleaned.matches('.').count() > 1 || decimals == 3 {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn first_amount(re: &Regex, text: &str) -> Option<f64> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .find_map(|m| parse_amount(m.as_str()))
}

fn currency(text: &str) -> Option<String> {
    let caps = RE_CURRENCY.captures(text)?;
    if let Some(code) = caps.get(1) {
        return Some(code.as_str().to_uppercase());
    }
    caps.get(2).map(|symbol| {
        match symbol.as_str() {
            "€" => "EUR",
            "$" => "USD",
            "£" => "GBP",
            _ => "CZK",
        }
        .to_string()
    })
}

fn invoice_number(text: &str) -> Option<String> {
    RE_INVOICE_NUMBER
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches(['-', '/']).to_string())
        .find(|s| s.chars().any(|c| c.is_ascii_digit()))
}

fn dates(text: &str) -> (Option<String>, Option<String>) {
    let due = RE_DUE_DATE.captures(text).and_then(|c| c.get(1));
    let due_range = due.map(|m| m.range());

    let issue = RE_ISSUE_DATE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .find(|m| Some(m.range()) != due_range)
        .or_else(|| {
            RE_ANY_DATE
                .captures_iter(text)
                .filter_map(|c| c.get(1))
                .find(|m| Some(m.range()) != due_range)
        });

    (
        issue.map(|m| m.as_str().replace(' ', "")),
        due.map(|m| m.as_str().replace(' ', "")),
    )
}

fn parties(text: &str) -> (Option<Party>, Option<Party>) {
    let registration_ids: Vec<String> = RE_REGISTRATION_ID
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    let tax_ids: Vec<String> = RE_TAX_ID
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_uppercase()))
        .collect();

    let vendor_name = first_capture(&RE_VENDOR, text).or_else(|| first_capture(&RE_LEGAL_FORM_LINE, text));
    let customer_name = first_capture(&RE_CUSTOMER, text);

    let vendor = Party {
        name: vendor_name,
        tax_id: tax_ids.first().cloned(),
        registration_id: registration_ids.first().cloned(),
    };
    let customer = Party {
        name: customer_name,
        tax_id: tax_ids.get(1).cloned(),
        registration_id: registration_ids.get(1).cloned(),
    };

    (
        (!vendor.is_empty()).then_some(vendor),
        (!customer.is_empty()).then_some(customer),
    )
}

pub(crate) fn line_items(text: &str) -> Vec<LineItem> {
    RE_LINE_ITEM
        .captures_iter(text)
        .filter_map(|c| {
            let description = c.get(1)?.as_str().trim().to_string();
            let lower = description.to_lowercase();
            if ["total", "celkem", "subtotal", "vat", "dph", "základ"]
                .iter()
                .any(|w| lower.starts_with(w))
            {
                return None;
            }
            Some(LineItem {
                description,
                quantity: c.get(2).and_then(|m| parse_amount(m.as_str())),
                unit_price: c.get(3).and_then(|m| parse_amount(m.as_str())),
                total: c.get(4).and_then(|m| parse_amount(m.as_str())),
                vat_rate: None,
            })
        })
        .collect()
}

/// Extract structured fields from raw text
pub fn extract_fields(text: &str) -> StructuredFields {
    let (date, due_date) = dates(text);
    let (vendor, customer) = parties(text);

    let totals = Totals {
        subtotal: first_amount(&RE_SUBTOTAL, text),
        vat_amount: first_amount(&RE_VAT_AMOUNT, text),
        total: first_amount(&RE_TOTAL, text),
    };

    let mut fields = StructuredFields {
        document_type: DocumentType::detect(text),
        vendor,
        customer,
        totals: Some(totals),
        invoice_number: invoice_number(text),
        date,
        due_date,
        currency: currency(text),
        bank_account: first_capture(&RE_BANK_ACCOUNT, text),
        variable_symbol: first_capture(&RE_VARIABLE_SYMBOL, text),
        line_items: line_items(text),
    };
    fields.prune();
    fields
}

/// Confidence of a pattern extraction, proportional to the key fields found
pub fn pattern_confidence(fields: &StructuredFields) -> f64 {
    let found = [
        fields.vendor_name().is_some(),
        fields.amount().is_some(),
        fields.date.is_some(),
        fields.invoice_number.is_some(),
        fields.currency.is_some(),
        fields
            .vendor
            .as_ref()
            .is_some_and(|v| v.registration_id.is_some()),
    ]
    .iter()
    .filter(|f| **f)
    .count();

    MIN_PATTERN_CONFIDENCE + (MAX_PATTERN_CONFIDENCE - MIN_PATTERN_CONFIDENCE) * found as f64 / 6.0
}
