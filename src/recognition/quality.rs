//! Text quality analysis
//!
//! Computes the [`QualityMetrics`] attached to every successful recognition
//! result, and the text-quality score shared by the decision and fusion
//! engines.

#![allow(clippy::cast_precision_loss)]

use crate::text::domain_term_count;

use super::types::QualityMetrics;

/// Text length at which the length bonus saturates
const LENGTH_BONUS_CAP: usize = 800;

/// Punctuation that is normal in business documents
const COMMON_PUNCTUATION: &str = ".,:;-/()%€$£&'\"#+*@!?=_";

/// Analyze recognized text
pub fn analyze(text: &str) -> QualityMetrics {
    let text_length = text.chars().count();
    let words: Vec<&str> = text.split_whitespace().collect();
    let word_count = words.len();

    let readable = words.iter().filter(|w| is_readable_word(w)).count();
    let readable_word_ratio = if word_count == 0 {
        0.0
    } else {
        readable as f64 / word_count as f64
    };

    let non_space: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    let special = non_space
        .iter()
        .filter(|c| !c.is_alphanumeric() && !COMMON_PUNCTUATION.contains(**c))
        .count();
    let special_char_ratio = if non_space.is_empty() {
        0.0
    } else {
        special as f64 / non_space.len() as f64
    };

    QualityMetrics {
        text_length,
        word_count,
        readable_word_ratio,
        special_char_ratio,
        detected_error_count: count_error_markers(text),
        language_consistency: language_consistency(text),
    }
}

/// Text-quality score in [0, 1]
///
/// Length bonus (capped), readable-word ratio, domain-vocabulary bonus, minus
/// penalties for special characters and OCR error markers.
pub fn text_quality_score(text: &str, metrics: &QualityMetrics) -> f64 {
    if metrics.text_length == 0 {
        return 0.0;
    }

    let length_factor = (metrics.text_length.min(LENGTH_BONUS_CAP) as f64) / LENGTH_BONUS_CAP as f64;
    let domain_factor = (domain_term_count(text) as f64 / 4.0).min(1.0);
    let cleanliness = (1.0 - metrics.special_char_ratio * 3.0).max(0.0);
    let error_penalty = (metrics.detected_error_count as f64 * 0.03).min(0.2);

    (0.25 * length_factor
        + 0.35 * metrics.readable_word_ratio
        + 0.20 * domain_factor
        + 0.20 * cleanliness
        - error_penalty)
        .clamp(0.0, 1.0)
}

fn is_readable_word(word: &str) -> bool {
    let trimmed = word.trim_matches(|c: char| COMMON_PUNCTUATION.contains(c));
    if trimmed.is_empty() {
        return false;
    }

    let total = trimmed.chars().count();
    let alphabetic = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    let digits = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
    let numeric_like = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || ".,-/:".contains(c));

    if numeric_like && digits > 0 {
        return true;
    }

    // identifiers such as CZ25596641 or FV2024
    let letters_then_digits = {
        // byte offset, split_at panics inside a multibyte char
        let split = trimmed.find(|c: char| c.is_ascii_digit()).unwrap_or(trimmed.len());
        let (head, tail) = trimmed.split_at(split);
        !head.is_empty()
            && head.len() <= 4
            && head.chars().all(|c| c.is_ascii_uppercase())
            && !tail.is_empty()
            && tail.chars().all(|c| c.is_ascii_digit())
    };
    if letters_then_digits {
        return true;
    }

    // dots inside abbreviations such as "s.r.o" do not count against a word
    let scored = trimmed.chars().filter(|c| *c != '.').count().max(1);
    (total >= 2 || alphabetic == 1) && alphabetic as f64 / scored as f64 >= 0.8
}

fn count_error_markers(text: &str) -> usize {
    let replacement = text.matches('\u{fffd}').count();

    let mut runs = 0;
    let mut run_len = 0;
    for c in text.chars() {
        if !c.is_alphanumeric() && !c.is_whitespace() && !".,-".contains(c) {
            run_len += 1;
            if run_len == 3 {
                runs += 1;
            }
        } else {
            run_len = 0;
        }
    }

    // letter/digit confusions inside otherwise alphabetic words, e.g. "Tota1", "INV0ICE"
    let confusions = text
        .split_whitespace()
        .filter(|w| {
            let letters = w.chars().filter(|c| c.is_alphabetic()).count();
            let confusable = w.chars().filter(|c| matches!(c, '0' | '1' | '5')).count();
            let digits = w.chars().filter(|c| c.is_ascii_digit()).count();
            letters >= 3 && confusable == 1 && digits == 1
        })
        .count();

    replacement + runs + confusions
}

/// Share of letters in the dominant script
fn language_consistency(text: &str) -> f64 {
    let mut latin = 0usize;
    let mut cyrillic = 0usize;
    let mut greek = 0usize;
    let mut other = 0usize;

    for c in text.chars().filter(|c| c.is_alphabetic()) {
        match c as u32 {
            0x0041..=0x024F => latin += 1,
            0x0370..=0x03FF => greek += 1,
            0x0400..=0x04FF => cyrillic += 1,
            _ => other += 1,
        }
    }

    let total = latin + cyrillic + greek + other;
    if total == 0 {
        return 0.5;
    }
    let dominant = latin.max(cyrillic).max(greek).max(other);
    dominant as f64 / total as f64
}
