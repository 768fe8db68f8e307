//! Extraction engine — pulls values out of step results into
//! `extracted_data` for later templating.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::model::{Extract, ExtractRule};

// ---------------------------------------------------------------------------
// JSONPath mini-parser
// ---------------------------------------------------------------------------

/// Navigate a JSONPath-style expression of the supported subset:
///
/// - `$.key` / `key` — top-level key (the `$.` prefix is optional)
/// - `key.subkey` — nested key
/// - `key[0]` — array index
/// - `key[0].subkey` — index followed by key
///
/// Wildcards, filters, and bracket-notation key access are not supported.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        if let Some(bracket_pos) = segment.find('[') {
            let key = &segment[..bracket_pos];
            let closing = segment.rfind(']')?;
            let idx_str = &segment[bracket_pos + 1..closing];

            if !key.is_empty() {
                current = current.get(key)?;
            }
            let idx: usize = idx_str.parse().ok()?;
            current = current.get(idx)?;
        } else {
            current = current.get(segment)?;
        }
    }
    Some(current)
}

/// Convert a JSON value to a plain string for storage as a variable.
/// Strings lose their surrounding quotes; other types keep their JSON form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ExtractContext / ExtractOutcome
// ---------------------------------------------------------------------------

/// The parts of a step result an extractor can read.
pub struct ExtractContext<'a> {
    pub status: u16,
    /// Response headers with lowercased names.
    pub headers: &'a HashMap<String, String>,
    pub body: &'a str,
}

/// Result of evaluating a single extract rule.
#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub name: String,
    pub success: bool,
    pub value: Option<Value>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a single extract against the response. Missing matches fall back
/// to the rule's `default` when present; never panics.
pub fn evaluate_extract(
    extract: &Extract,
    ctx: &ExtractContext,
    resolver: &dyn Fn(&str) -> Option<Value>,
) -> ExtractOutcome {
    let (success, value, message) = match &extract.rule {
        ExtractRule::JsonPath { expression } => {
            match serde_json::from_str::<Value>(ctx.body) {
                Ok(json) => match json_path(&json, expression) {
                    Some(found) => (
                        true,
                        Some(found.clone()),
                        format!("JSON path \"{expression}\" matched"),
                    ),
                    None => (
                        false,
                        None,
                        format!("JSON path \"{expression}\" not found in response body"),
                    ),
                },
                Err(e) => (
                    false,
                    None,
                    format!("Failed to parse response body as JSON: {e}"),
                ),
            }
        }

        ExtractRule::Regex { pattern, group } => match Regex::new(pattern) {
            Ok(re) => match re.captures(ctx.body) {
                Some(caps) => match caps.get(*group as usize) {
                    Some(m) => (
                        true,
                        Some(Value::String(m.as_str().to_string())),
                        format!("Regex \"{pattern}\" group {group} matched"),
                    ),
                    None => (
                        false,
                        None,
                        format!("Regex \"{pattern}\" matched but group {group} does not exist"),
                    ),
                },
                None => (
                    false,
                    None,
                    format!("Regex \"{pattern}\" did not match the response body"),
                ),
            },
            Err(e) => (false, None, format!("Invalid regex pattern \"{pattern}\": {e}")),
        },

        ExtractRule::Header { header } => {
            let key = header.to_lowercase();
            match ctx.headers.get(&key) {
                Some(value) => (
                    true,
                    Some(Value::String(value.clone())),
                    format!("Header \"{header}\" matched"),
                ),
                None => (
                    false,
                    None,
                    format!("Header \"{header}\" not found in response"),
                ),
            }
        }

        ExtractRule::Custom { expression } => {
            match crate::expr::evaluate(expression, resolver) {
                Ok(Value::Null) => (
                    false,
                    None,
                    format!("Custom expression \"{expression}\" produced null"),
                ),
                Ok(value) => (true, Some(value), "Custom expression matched".to_string()),
                Err(e) => (false, None, format!("Custom expression failed: {e}")),
            }
        }
    };

    // Fall back to the configured default when the rule produced nothing.
    let (success, value) = if !success && extract.default.is_some() {
        (true, extract.default.clone())
    } else {
        (success, value)
    };

    ExtractOutcome {
        name: extract.name.clone(),
        success,
        value,
        message,
    }
}

/// Evaluate every extract on a step and return the individual outcomes.
pub fn evaluate_all(
    extracts: &[Extract],
    ctx: &ExtractContext,
    resolver: &dyn Fn(&str) -> Option<Value>,
) -> Vec<ExtractOutcome> {
    extracts
        .iter()
        .map(|e| evaluate_extract(e, ctx, resolver))
        .collect()
}
