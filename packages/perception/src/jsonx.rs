//! Defensive JSON parsing for solver output.
//!
//! Models return fenced, truncated or comma-damaged JSON often enough that
//! every consumer parses through this ladder: direct parse, fence strip,
//! outermost bracket location, trailing-comma repair, and finally per-object
//! salvage.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Strip markdown code fences around a JSON payload.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.trim_end_matches("```").trim();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.trim_end_matches("```").trim();
    }
    trimmed
}

/// Remove trailing commas before `]` or `}`.
pub fn repair_trailing_commas(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid repair regex"));
    re.replace_all(text, "$1").into_owned()
}

fn slice_outermost(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Extract a JSON array from solver output, tolerating fences and noise.
pub fn extract_json_array(text: &str) -> Vec<Value> {
    let cleaned = strip_fences(text);

    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(cleaned) {
        return items;
    }

    if let Some(slice) = slice_outermost(cleaned, '[', ']') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(slice) {
            return items;
        }
        let repaired = repair_trailing_commas(slice);
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&repaired) {
            return items;
        }
    }

    // Last resort: salvage individual objects.
    salvage_objects(cleaned)
}

/// Extract a JSON object from solver output, tolerating fences and noise.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let cleaned = strip_fences(text);

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(cleaned) {
        return Some(value);
    }

    let slice = slice_outermost(cleaned, '{', '}')?;
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(slice) {
        return Some(value);
    }
    let repaired = repair_trailing_commas(slice);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&repaired) {
        return Some(value);
    }
    None
}

/// Pull out every well-formed top-level `{...}` object, balancing braces and
/// respecting strings. Used when the envelope itself is broken.
pub fn salvage_objects(text: &str) -> Vec<Value> {
    let mut objects = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let start = i;
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
                        end = Some(start + offset);
                        break;
                    }
                }
                _ => {}
            }
        }

        match end {
            Some(end) => {
                let candidate = &text[start..=end];
                let repaired = repair_trailing_commas(candidate);
                if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&repaired) {
                    objects.push(value);
                }
                i = end + 1;
            }
            None => break,
        }
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_array_parse() {
        let items = extract_json_array(r#"[{"title": "A", "price": "$9.99"}]"#);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["title"], "A");
    }

    #[test]
    fn test_fenced_array() {
        let text = "Here you go:\n```json\n[{\"title\": \"A\"}]\n```";
        let items = extract_json_array(text);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_array_with_surrounding_prose() {
        let text = "The products are: [{\"title\": \"A\"}, {\"title\": \"B\"}] as requested.";
        assert_eq!(extract_json_array(text).len(), 2);
    }

    #[test]
    fn test_trailing_comma_repair() {
        let text = r#"[{"title": "A", }, {"title": "B"},]"#;
        let items = extract_json_array(text);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_salvage_from_broken_envelope() {
        // Truncated array: second object incomplete.
        let text = r#"[{"title": "A", "price": "$1"}, {"title": "B", "pr"#;
        let items = extract_json_array(text);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["title"], "A");
    }

    #[test]
    fn test_object_extraction_with_noise() {
        let text = "Sure.\n```\n{\"evaluations\": [], \"summary\": \"none\"}\n```";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["summary"], "none");
    }

    #[test]
    fn test_braces_inside_strings_do_not_break_salvage() {
        let text = r#"noise {"title": "Widget {large}", "ok": true} noise"#;
        let objects = salvage_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["title"], "Widget {large}");
    }

    #[test]
    fn test_empty_input() {
        assert!(extract_json_array("").is_empty());
        assert!(extract_json_object("").is_none());
    }
}
