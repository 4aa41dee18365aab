// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output normalization.
//!
//! Providers wrap JSON in markdown fences, prepend prose, or append
//! commentary. Normalization strips all of that and validates the result
//! against the caller's schema before anything downstream sees it.

use crate::LlmError;
use serde_json::Value;

/// Extract and parse the first JSON object from raw model output.
pub fn normalize_json(raw: &str) -> Result<Value, LlmError> {
    let trimmed = strip_fences(raw.trim());

    // The whole payload may already be clean JSON.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    // Otherwise locate the first balanced object.
    let candidate = first_object(trimmed)
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in output".into()))?;
    serde_json::from_str(candidate)
        .map_err(|e| LlmError::InvalidResponse(format!("unparseable JSON object: {e}")))
}

/// Validate a value against a JSON schema.
pub fn validate_schema(value: &Value, schema: &Value) -> Result<(), LlmError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| LlmError::InvalidResponse(format!("bad schema: {e}")))?;
    if validator.is_valid(value) {
        Ok(())
    } else {
        let problems: Vec<String> = validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .take(3)
            .collect();
        Err(LlmError::InvalidResponse(format!(
            "schema mismatch: {}",
            problems.join("; ")
        )))
    }
}

fn strip_fences(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    // Drop an optional language tag up to the first newline.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    body.trim().strip_suffix("```").unwrap_or(body).trim()
}

fn first_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_json_passes_through() {
        let value = normalize_json(r#"{"account": "a1", "confidence": 92}"#).unwrap();
        assert_eq!(value["confidence"], 92);
    }

    #[test]
    fn strips_markdown_fences() {
        let raw = "```json\n{\"account\": \"a1\"}\n```";
        let value = normalize_json(raw).unwrap();
        assert_eq!(value["account"], "a1");
    }

    #[test]
    fn strips_fences_without_language_tag() {
        let raw = "```\n{\"ok\": true}\n```";
        assert_eq!(normalize_json(raw).unwrap()["ok"], true);
    }

    #[test]
    fn extracts_object_from_prose() {
        let raw = "Here is the categorization:\n{\"account\": \"a2\"}\nLet me know!";
        assert_eq!(normalize_json(raw).unwrap()["account"], "a2");
    }

    #[test]
    fn handles_nested_objects_and_strings() {
        let raw = r#"prefix {"a": {"b": "closing } brace in string"}, "c": 1} suffix"#;
        let value = normalize_json(raw).unwrap();
        assert_eq!(value["c"], 1);
        assert_eq!(value["a"]["b"], "closing } brace in string");
    }

    #[test]
    fn no_object_is_invalid() {
        assert!(matches!(
            normalize_json("I could not categorize this."),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn schema_validation_accepts_matching() {
        let schema = json!({
            "type": "object",
            "required": ["account", "confidence"],
            "properties": {
                "account": {"type": "string"},
                "confidence": {"type": "integer"}
            }
        });
        let value = json!({"account": "a1", "confidence": 88});
        validate_schema(&value, &schema).unwrap();
    }

    #[test]
    fn schema_validation_rejects_missing_field() {
        let schema = json!({
            "type": "object",
            "required": ["account"],
            "properties": {"account": {"type": "string"}}
        });
        let value = json!({"confidence": 88});
        assert!(matches!(
            validate_schema(&value, &schema),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
