//! Confidence extraction from free-text provider responses
//!
//! Explicit figures ("85% confident", "confidence: 0.92") are used verbatim.
//! Without one, a default is derived from textual signals: hedging pulls it
//! below 0.5, long justified answers push it above 0.7, and anything else sits
//! at 0.5. The result depends only on the text.

use once_cell::sync::Lazy;
use regex::Regex;

const DEFAULT_CONFIDENCE: f64 = 0.5;
const HEDGED_CONFIDENCE: f64 = 0.35;
const HEDGED_FLOOR: f64 = 0.2;
const JUSTIFIED_CONFIDENCE: f64 = 0.75;
const JUSTIFIED_CEILING: f64 = 0.9;
const SIGNAL_STEP: f64 = 0.05;
/// Minimum length before connectives count as a detailed justification
const DETAILED_RESPONSE_CHARS: usize = 200;

static PERCENT_BEFORE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,3}(?:\.\d+)?)\s*%\s*(?:confident|confidence|certain|sure)\b")
        .expect("percent pattern is valid")
});

static KEYWORD_BEFORE_PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bconfidence(?:\s+(?:level|score))?\s*(?:[:=]|\bis\b|\bof\b)?\s*(\d{1,3}(?:\.\d+)?)\s*%",
    )
    .expect("keyword percent pattern is valid")
});

static KEYWORD_DECIMAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bconfidence(?:\s+(?:level|score))?\s*(?:[:=]|\bis\b|\bof\b)?\s*(0?\.\d+|1\.0+|[01])\b",
    )
    .expect("keyword decimal pattern is valid")
});

/// Lowercase `may` only, so the month does not read as a hedge
static HEDGES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?i:might|uncertain|possibly|perhaps|unclear|not sure|could be)|may)\b")
        .expect("hedge pattern is valid")
});

static JUSTIFICATIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:because|therefore|evidence|since|consequently|as a result|due to)\b")
        .expect("justification pattern is valid")
});

/// Extract a confidence in [0, 1] from response text
pub fn extract_confidence(text: &str) -> f64 {
    explicit_confidence(text)
        .unwrap_or_else(|| heuristic_confidence(text))
        .clamp(0.0, 1.0)
}

/// An explicitly stated confidence, if the text contains one
pub fn explicit_confidence(text: &str) -> Option<f64> {
    for pattern in [&*PERCENT_BEFORE_KEYWORD, &*KEYWORD_BEFORE_PERCENT] {
        if let Some(value) = first_number(pattern, text) {
            return Some(value / 100.0);
        }
    }
    first_number(&KEYWORD_DECIMAL, text)
}

fn first_number(pattern: &Regex, text: &str) -> Option<f64> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn heuristic_confidence(text: &str) -> f64 {
    let hedges = HEDGES.find_iter(text).count();
    if hedges > 0 {
        let lowered = HEDGED_CONFIDENCE - SIGNAL_STEP * (hedges - 1) as f64;
        return lowered.max(HEDGED_FLOOR);
    }

    let justifications = JUSTIFICATIONS.find_iter(text).count();
    if text.chars().count() >= DETAILED_RESPONSE_CHARS && justifications > 0 {
        let raised = JUSTIFIED_CONFIDENCE + SIGNAL_STEP * (justifications - 1) as f64;
        return raised.min(JUSTIFIED_CEILING);
    }

    DEFAULT_CONFIDENCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_percent_confident() {
        assert_eq!(extract_confidence("I am 85% confident this is spam"), 0.85);
    }

    #[test]
    fn test_decimal_confidence() {
        assert_eq!(extract_confidence("Category: billing\nConfidence: 0.92"), 0.92);
    }

    #[test]
    fn test_confidence_level_percent() {
        assert_eq!(extract_confidence("Confidence level: 70%"), 0.7);
    }

    #[test]
    fn test_confidence_is_decimal() {
        assert_eq!(extract_confidence("My confidence is .6 overall"), 0.6);
    }

    #[test]
    fn test_explicit_value_wins_over_hedging() {
        assert_eq!(
            extract_confidence("This might be phishing, I'm 90% sure"),
            0.9
        );
    }

    #[test]
    fn test_hedging_lowers_confidence() {
        let confidence = extract_confidence("This might be a billing question, possibly.");
        assert!(confidence < 0.5);
    }

    #[test]
    fn test_month_name_is_not_a_hedge() {
        assert_eq!(extract_confidence("Schedule the review meeting in May."), DEFAULT_CONFIDENCE);
        assert!(extract_confidence("The invoice may be overdue.") < DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_many_hedges_hit_floor() {
        let text = "might may perhaps possibly unclear uncertain could be not sure";
        assert_eq!(extract_confidence(text), HEDGED_FLOOR);
    }

    #[test]
    fn test_detailed_justification_raises_confidence() {
        let text = "The sender is the finance department because the signature block and \
                    domain match previous invoices. The attached PDF references an order \
                    number that appears in the thread, therefore this is a legitimate \
                    invoice and should be routed to accounts payable.";
        assert!(text.len() >= DETAILED_RESPONSE_CHARS);
        assert!(extract_confidence(text) > 0.7);
    }

    #[test]
    fn test_short_justification_stays_default() {
        assert_eq!(extract_confidence("Spam because yes."), DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_plain_text_defaults_to_mid_range() {
        assert_eq!(extract_confidence("Category: support"), DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_out_of_range_percentage_is_clamped() {
        assert_eq!(extract_confidence("I am 150% confident"), 1.0);
    }

    #[test]
    fn test_word_boundaries_for_hedges() {
        // "mayor" and "maybelline" must not count as hedging
        assert_eq!(
            extract_confidence("The mayor ordered maybelline products"),
            DEFAULT_CONFIDENCE
        );
    }

    proptest! {
        #[test]
        fn explicit_percent_is_returned_exactly(n in 0u32..=100) {
            let text = format!("I am {n}% confident in this answer");
            prop_assert_eq!(extract_confidence(&text), n as f64 / 100.0);
        }

        #[test]
        fn extraction_is_deterministic(text in ".{0,300}") {
            prop_assert_eq!(extract_confidence(&text), extract_confidence(&text));
        }

        #[test]
        fn extraction_stays_in_unit_interval(text in ".{0,300}") {
            let confidence = extract_confidence(&text);
            prop_assert!((0.0..=1.0).contains(&confidence));
        }

        #[test]
        fn hedged_text_without_numbers_is_below_half(prefix in "[a-z ]{0,40}") {
            let text = format!("{prefix} it might be spam");
            prop_assume!(!prefix.contains("confiden"));
            prop_assert!(extract_confidence(&text) < 0.5);
        }
    }
}
