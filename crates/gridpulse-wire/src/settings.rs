//! Connection-string grammar: semicolon-separated `key=value` pairs with
//! brace quoting for values and case-insensitive keys.

use std::collections::HashMap;

/// Parse a key/value list. Keys are lowercased; values keep their case.
/// A value wrapped in `{ }` may contain the pair and list delimiters.
pub fn parse_key_value_pairs(input: &str) -> HashMap<String, String> {
    let mut settings = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        // Key runs up to '=', trimmed.
        let mut key = String::new();
        for ch in chars.by_ref() {
            if ch == '=' {
                break;
            }
            if ch == ';' {
                // Empty pair; restart the key.
                key.clear();
                continue;
            }
            key.push(ch);
        }
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() && chars.peek().is_none() {
            break;
        }

        // Value runs to the next ';' unless brace quoted.
        let mut value = String::new();
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut depth = 1usize;
            for ch in chars.by_ref() {
                match ch {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                value.push(ch);
            }
            // Consume up to the trailing list delimiter.
            for ch in chars.by_ref() {
                if ch == ';' {
                    break;
                }
            }
        } else {
            for ch in chars.by_ref() {
                if ch == ';' {
                    break;
                }
                value.push(ch);
            }
            value = value.trim().to_string();
        }

        if !key.is_empty() {
            settings.insert(key, value);
        }
        if chars.peek().is_none() {
            break;
        }
    }

    settings
}

/// Parse common boolean spellings; `None` when unrecognized.
pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs_case_insensitive() {
        let settings = parse_key_value_pairs("IncludeTime=true; lagTime=10.0;throttled=1");
        assert_eq!(settings.get("includetime").map(String::as_str), Some("true"));
        assert_eq!(settings.get("lagtime").map(String::as_str), Some("10.0"));
        assert_eq!(settings.get("throttled").map(String::as_str), Some("1"));
    }

    #[test]
    fn brace_quoted_values_keep_delimiters() {
        let settings =
            parse_key_value_pairs("dataChannel={port=9999; interface=0.0.0.0}; includeTime=false");
        assert_eq!(
            settings.get("datachannel").map(String::as_str),
            Some("port=9999; interface=0.0.0.0")
        );
        assert_eq!(
            settings.get("includetime").map(String::as_str),
            Some("false")
        );

        let nested = parse_key_value_pairs(&format!(
            "filterExpression={{{}}}",
            "FILTER ActiveMeasurements WHERE SignalType='FREQ'"
        ));
        assert_eq!(
            nested.get("filterexpression").map(String::as_str),
            Some("FILTER ActiveMeasurements WHERE SignalType='FREQ'")
        );
    }

    #[test]
    fn empty_and_trailing_separators() {
        assert!(parse_key_value_pairs("").is_empty());
        let settings = parse_key_value_pairs("a=1;;b=2;");
        assert_eq!(settings.get("a").map(String::as_str), Some("1"));
        assert_eq!(settings.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn boolean_spellings() {
        assert_eq!(parse_boolean("TRUE"), Some(true));
        assert_eq!(parse_boolean(" no "), Some(false));
        assert_eq!(parse_boolean("maybe"), None);
    }
}
