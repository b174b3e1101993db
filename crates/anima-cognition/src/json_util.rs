//! Validator layer for dynamic LLM JSON output: accept raw text, extract
//! the first JSON object substring, schema-validate into a typed structure.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// Extract and parse the first JSON object in `raw`. Tries the whole string
/// first, then the widest `{...}` substring.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value) if value.is_object() => Some(value),
        _ => {
            debug!("no parseable JSON object in LLM output");
            None
        }
    }
}

/// Extract, then deserialize into `T`. `None` on any shape mismatch — the
/// caller substitutes its safe default.
pub fn parse_typed<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let value = extract_json_object(raw)?;
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_types::{ActionType, GoalSpec};

    #[test]
    fn parses_clean_json() {
        let value = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_object_from_prose() {
        let raw = "Sure! Here is the goal:\n{\"goal\": \"look around\", \"action_type\": \"observe\", \"risk_level\": \"low\"}\nHope that helps.";
        let goal: GoalSpec = parse_typed(raw).unwrap();
        assert_eq!(goal.action_type, ActionType::Observe);
        assert_eq!(goal.goal, "look around");
    }

    #[test]
    fn rejects_arrays_and_garbage() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("").is_none());
        assert!(extract_json_object("{ broken").is_none());
    }

    #[test]
    fn invalid_enum_value_fails_typed_parse() {
        let raw = r#"{"goal": "x", "action_type": "destroy", "risk_level": "low"}"#;
        assert!(parse_typed::<GoalSpec>(raw).is_none());
    }
}
