//! Flow-rate extraction fallback: the fine-time response's
//! `fine_flow_rate` field is preferred whenever present, but older
//! analysis-service versions only ever put the number in the free-text
//! `message`. Kept for compatibility with those responses rather than
//! removed.

use regex::Regex;
use std::sync::LazyLock;

static FLOW_RATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(\d+\.?\d*)\s*g/s").unwrap(),
        Regex::new(r"(?i)flow.rate.*?(\d+\.?\d*)").unwrap(),
    ]
});

/// Prefer `field`; fall back to parsing `message` with a fixed set of
/// regexes; log a warning and give up if neither yields a value.
pub fn extract_flow_rate(field: Option<f64>, message: &str) -> Option<f64> {
    if let Some(value) = field {
        return Some(value);
    }
    for pattern in FLOW_RATE_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(message) {
            if let Some(m) = captures.get(1) {
                if let Ok(value) = m.as_str().parse::<f64>() {
                    return Some(value);
                }
            }
        }
    }
    tracing::warn!(message, "could not extract fine flow rate from response");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_field_over_message() {
        assert_eq!(extract_flow_rate(Some(12.5), "flow rate 99 g/s"), Some(12.5));
    }

    #[test]
    fn parses_gs_unit_pattern() {
        assert_eq!(extract_flow_rate(None, "measured 4.2 g/s during dribble"), Some(4.2));
    }

    #[test]
    fn parses_flow_rate_word_pattern() {
        assert_eq!(extract_flow_rate(None, "flow rate: 7.5 recorded"), Some(7.5));
    }

    #[test]
    fn returns_none_when_nothing_matches() {
        assert_eq!(extract_flow_rate(None, "no numeric data here"), None);
    }
}
