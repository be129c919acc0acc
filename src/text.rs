//! Text similarity and normalization helpers
//!
//! Shared by the decision engine (cross-validation), the fusion engine
//! (fusion-quality heuristic) and the extraction cache (key normalization).

#![allow(clippy::cast_precision_loss)]

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Upper bound on characters fed to quadratic comparisons
pub(crate) const MAX_COMPARE_CHARS: usize = 4000;

pub fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Leading `max_chars` characters of `text`, cut on a char boundary
pub(crate) fn char_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Levenshtein distance over the first [`MAX_COMPARE_CHARS`] characters
pub fn levenshtein(a: &str, b: &str) -> usize {
    strsim::levenshtein(char_prefix(a, MAX_COMPARE_CHARS), char_prefix(b, MAX_COMPARE_CHARS))
}

/// Normalized edit-distance ratio in [0, 1]; 1.0 means identical
pub fn edit_ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(char_prefix(a, MAX_COMPARE_CHARS), char_prefix(b, MAX_COMPARE_CHARS))
}

/// Jaccard similarity of the lowercase word sets
pub fn jaccard_words(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = words(a).into_iter().collect();
    let set_b: HashSet<String> = words(b).into_iter().collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Combined text similarity: 60% edit-distance ratio, 40% word-set Jaccard
pub fn text_similarity(a: &str, b: &str) -> f64 {
    (0.6 * edit_ratio(a, b) + 0.4 * jaccard_words(a, b)).clamp(0.0, 1.0)
}

/// Number of distinct domain terms occurring in the text
pub fn domain_term_count(text: &str) -> usize {
    let lower = text.to_lowercase();
    DOMAIN_TERMS.iter().filter(|t| lower.contains(*t)).count()
}

/// Normalize text for cache keying.
///
/// Lower-cases, masks dates, amounts and reference numbers with placeholders
/// and collapses whitespace. The placeholders contain no digits, so applying
/// the function twice yields the same string.
pub fn normalize_for_cache(text: &str) -> String {
    let lower = collapse_whitespace(&text.to_lowercase());
    let masked = RE_DATE.replace_all(&lower, " <date> ");
    let masked = RE_AMOUNT.replace_all(&masked, " <amount> ");
    let masked = RE_NUMBER.replace_all(&masked, "<num>");
    collapse_whitespace(&masked)
}

/// Collapse runs of whitespace into single spaces and trim the ends
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert_eq!(levenshtein("vystavení", "vystaveni"), 1);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_text_similarity_bounds() {
        assert_eq!(text_similarity("INVOICE 2024-001", "INVOICE 2024-001"), 1.0);
        assert!(text_similarity("INVOICE 2024-001", "totally different words") < 0.4);
        let close = text_similarity("Total 1500 CZK", "Tota1 1500 CZK");
        assert!(close > 0.6 && close < 1.0);
    }

    #[test]
    fn test_char_prefix_respects_boundaries() {
        assert_eq!(char_prefix("žluťoučký", 4), "žluť");
        assert_eq!(char_prefix("abc", 10), "abc");
        assert_eq!(char_prefix("", 3), "");
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_edit_ratio_caps_long_texts() {
        let long_a = "a".repeat(MAX_COMPARE_CHARS * 3);
        let long_b = format!("{}{}", "a".repeat(MAX_COMPARE_CHARS), "b".repeat(MAX_COMPARE_CHARS * 2));
        assert_eq!(edit_ratio(&long_a, &long_b), 1.0);
        assert_eq!(edit_ratio("", ""), 1.0);
    }

    #[test]
    fn test_jaccard_ignores_case_and_punctuation() {
        assert!((jaccard_words("Total: 1500", "total 1500") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_domain_terms() {
        assert!(domain_term_count("INVOICE Total 1500 CZK") >= 3);
        assert_eq!(domain_term_count("lorem ipsum"), 0);
    }

    #[test]
    fn test_normalize_masks_variable_parts() {
        let a = normalize_for_cache("Invoice 2024-001  dated 12.03.2024, Total 1 500,00 CZK");
        let b = normalize_for_cache("INVOICE 2024-777 dated 01.01.2023,   total 9 999,99 czk");
        assert_eq!(a, b);
        assert!(!a.chars().any(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "Faktura č. 20240015\nDatum: 2024-03-12\nCelkem 12 100,00 Kč",
            "   mixed   CASE\ttext  ",
            "",
            "<date> <amount> <num> already masked",
        ];
        for s in samples {
            let once = normalize_for_cache(s);
            assert_eq!(normalize_for_cache(&once), once);
        }
    }
}
