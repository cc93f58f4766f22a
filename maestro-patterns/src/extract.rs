//! ABOUTME: Parsing helpers for agent replies
//! ABOUTME: First balanced JSON object extraction and agreement-score scanning

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Extract and parse the first balanced `{...}` block in the text.
///
/// Agents often wrap their JSON in prose; scanning is string-aware so
/// braces inside string literals do not unbalance the block. Candidates
/// that fail to parse are skipped in favor of the next opening brace.
pub fn extract_first_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(rel) = text[search_from..].find('{') {
        let start = search_from + rel;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + offset + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        if let Some(end) = end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..end]) {
                return Some(value);
            }
            search_from = start + 1;
        } else {
            return None;
        }
    }
    None
}

fn agreement_regexes() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // "agreement: 8/10", "agreement 8 / 10"
            Regex::new(r"(?i)agreement[:\s]*([0-9]+(?:\.[0-9]+)?)\s*/\s*10").expect("static regex"),
            // "8 out of 10"
            Regex::new(r"(?i)([0-9]+(?:\.[0-9]+)?)\s+out\s+of\s+10").expect("static regex"),
            // "agreement: 0.8"
            Regex::new(r"(?i)agreement[:\s]*([01](?:\.[0-9]+)?)(?:\s|$)").expect("static regex"),
        ]
    })
}

/// Pull a participant's self-declared agreement score out of free text,
/// normalized to 0..1. Returns 0.5 when no declaration is found.
pub fn extract_agreement_score(text: &str) -> f64 {
    let regexes = agreement_regexes();
    for (i, regex) in regexes.iter().enumerate() {
        if let Some(captures) = regex.captures(text) {
            if let Some(raw) = captures.get(1) {
                if let Ok(value) = raw.as_str().parse::<f64>() {
                    let normalized = if i < 2 { value / 10.0 } else { value };
                    return normalized.clamp(0.0, 1.0);
                }
            }
        }
    }
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_plain_json() {
        let value = extract_first_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let text = r#"Here is my evaluation:

{"criteriaScores": {"clarity": 0.9}, "feedback": "solid"}

Hope that helps!"#;
        let value = extract_first_json_object(text).unwrap();
        assert_eq!(value["criteriaScores"]["clarity"], 0.9);
    }

    #[test]
    fn test_extract_handles_braces_in_strings() {
        let text = r#"note {"msg": "use {braces} carefully", "n": 2} end"#;
        let value = extract_first_json_object(text).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn test_extract_skips_unparseable_block() {
        let text = "{not json} but later {\"ok\": true}";
        let value = extract_first_json_object(text).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_extract_none_when_absent() {
        assert!(extract_first_json_object("no braces here").is_none());
        assert!(extract_first_json_object("{unterminated").is_none());
    }

    #[test]
    fn test_agreement_slash_ten() {
        assert_eq!(extract_agreement_score("agreement: 8/10"), 0.8);
        assert_eq!(extract_agreement_score("Agreement 7 / 10 overall"), 0.7);
        assert_eq!(extract_agreement_score("I rate agreement 10/10"), 1.0);
    }

    #[test]
    fn test_agreement_out_of_ten() {
        assert_eq!(extract_agreement_score("I'd say 6 out of 10"), 0.6);
    }

    #[test]
    fn test_agreement_decimal() {
        assert_eq!(extract_agreement_score("agreement: 0.85 "), 0.85);
    }

    #[test]
    fn test_agreement_default() {
        assert_eq!(extract_agreement_score("no score at all"), 0.5);
    }

    #[test]
    fn test_agreement_clamped() {
        assert_eq!(extract_agreement_score("agreement: 15/10"), 1.0);
    }
}
