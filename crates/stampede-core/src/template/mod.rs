//! Template processor — expands `{{...}}` tokens over serialised steps and
//! raw string fields.
//!
//! Resolution order inside a token: helper functions first (`randomInt`,
//! `uuid`, `now`), then `faker.<namespace>.<method>`, then the caller's
//! variable resolver (`__VU`, `__ITER`, `variables.*`, `extracted_data.*`,
//! dot paths). Unresolved tokens remain literal, which also makes
//! processing idempotent on fully-resolved text. Dollar-sign JSONPath
//! expressions are never token syntax and pass through untouched.

pub mod faker;

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::error::StampedeError;
use crate::model::Step;

/// A reusable, concurrency-safe template processor. The only mutable state
/// is the RNG, which sits behind a mutex so one seeded sequence is shared
/// by all VUs of a test run.
pub struct TemplateProcessor {
    rng: Mutex<StdRng>,
    locale: String,
}

impl TemplateProcessor {
    pub fn new(seed: Option<u64>, locale: Option<String>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            locale: locale.unwrap_or_else(|| "en".to_string()),
        }
    }

    /// Expand all tokens in `text` using the resolver for variable lookups.
    pub fn process(&self, text: &str, resolver: &dyn Fn(&str) -> Option<Value>) -> String {
        self.process_inner(text, resolver, false)
    }

    /// Run a step through the processor: serialise to JSON, expand tokens
    /// (with JSON string escaping), and re-parse. A parse failure after
    /// substitution is a fatal step error.
    pub fn process_step(
        &self,
        step: &Step,
        resolver: &dyn Fn(&str) -> Option<Value>,
    ) -> Result<Step, StampedeError> {
        let serialised = serde_json::to_string(step)?;
        let processed = self.process_inner(&serialised, resolver, true);
        serde_json::from_str(&processed).map_err(|e| {
            StampedeError::Engine(format!(
                "step \"{}\" is no longer parseable after templating: {e}",
                step.common.name
            ))
        })
    }

    fn process_inner(
        &self,
        text: &str,
        resolver: &dyn Fn(&str) -> Option<Value>,
        json_escape: bool,
    ) -> String {
        // Fast path: no tokens at all.
        if !text.contains("{{") {
            return text.to_string();
        }

        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let token = after[..end].trim();
                    match self.resolve_token(token, resolver) {
                        Some(value) => {
                            let rendered = crate::extract::value_to_string(&value);
                            if json_escape {
                                result.push_str(&escape_json_fragment(&rendered));
                            } else {
                                result.push_str(&rendered);
                            }
                        }
                        None => {
                            // Fail-open: keep the token literal.
                            result.push_str("{{");
                            result.push_str(&after[..end]);
                            result.push_str("}}");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    // Unclosed token — keep the remainder as-is.
                    result.push_str("{{");
                    rest = after;
                    break;
                }
            }
        }
        result.push_str(rest);
        result
    }

    fn resolve_token(
        &self,
        token: &str,
        resolver: &dyn Fn(&str) -> Option<Value>,
    ) -> Option<Value> {
        if token.is_empty() {
            return None;
        }

        // Helper functions are resolved before anything else.
        if let Some(value) = self.resolve_helper(token) {
            return Some(value);
        }

        // faker.<namespace>.<method>([args])
        if let Some(rest) = token.strip_prefix("faker.") {
            let (path, args) = split_call(rest);
            let mut parts = path.splitn(2, '.');
            let namespace = parts.next()?;
            let method = parts.next()?;
            let mut rng = self.rng.lock().expect("template rng poisoned");
            return faker::generate(&mut rng, &self.locale, namespace, method, &args);
        }

        resolver(token)
    }

    fn resolve_helper(&self, token: &str) -> Option<Value> {
        if token == "uuid" || token == "uuid()" {
            return Some(Value::String(uuid::Uuid::new_v4().to_string()));
        }
        if token == "now" || token == "now()" {
            return Some(Value::Number(serde_json::Number::from(
                crate::clock::epoch_ms(),
            )));
        }
        if let Some(rest) = token.strip_prefix("randomInt") {
            let (path, args) = split_call(rest);
            if !path.is_empty() {
                return None;
            }
            let min = args.first().and_then(Value::as_i64)?;
            let max = args.get(1).and_then(Value::as_i64)?;
            if min > max {
                return None;
            }
            let mut rng = self.rng.lock().expect("template rng poisoned");
            return Some(Value::Number(serde_json::Number::from(
                rng.gen_range(min..=max),
            )));
        }
        None
    }
}

/// Split `"name(arg, arg)"` into the name part and parsed argument values.
/// A token without parentheses yields the whole string and no arguments.
fn split_call(token: &str) -> (String, Vec<Value>) {
    let Some(open) = token.find('(') else {
        return (token.to_string(), Vec::new());
    };
    let name = token[..open].to_string();
    let inner = token[open + 1..].trim_end_matches(')');
    let args = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_arg)
        .collect();
    (name, args)
}

fn parse_arg(raw: &str) -> Value {
    let trimmed = raw.trim_matches(|c| c == '\'' || c == '"');
    if trimmed != raw {
        return Value::String(trimmed.to_string());
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(serde_json::Number::from(n));
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

/// Escape a substitution so it stays valid inside a JSON string literal.
fn escape_json_fragment(s: &str) -> String {
    // serde_json gives us the canonical escaping; strip the outer quotes.
    let quoted = serde_json::to_string(s).unwrap_or_default();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processor() -> TemplateProcessor {
        TemplateProcessor::new(Some(7), None)
    }

    fn resolver(name: &str) -> Option<Value> {
        match name {
            "token" => Some(json!("T-42")),
            "__VU" => Some(json!(3)),
            "__ITER" => Some(json!(1)),
            "user.name" => Some(json!("alice")),
            "variables.host" => Some(json!("example.com")),
            "extracted_data.id" => Some(json!(99)),
            "quote" => Some(json!("say \"hi\"")),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Basic substitution
    // -----------------------------------------------------------------------

    #[test]
    fn substitutes_simple_variable() {
        let p = processor();
        assert_eq!(
            p.process("Bearer {{token}}", &resolver),
            "Bearer T-42"
        );
    }

    #[test]
    fn substitutes_special_names() {
        let p = processor();
        assert_eq!(p.process("vu={{__VU}} iter={{__ITER}}", &resolver), "vu=3 iter=1");
    }

    #[test]
    fn substitutes_dot_paths_and_prefixes() {
        let p = processor();
        assert_eq!(
            p.process("{{user.name}}@{{variables.host}}/{{extracted_data.id}}", &resolver),
            "alice@example.com/99"
        );
    }

    #[test]
    fn unresolved_token_stays_literal() {
        let p = processor();
        assert_eq!(p.process("x={{missing}}", &resolver), "x={{missing}}");
    }

    #[test]
    fn idempotent_on_resolved_text() {
        let p = processor();
        let once = p.process("Bearer {{token}}", &resolver);
        let twice = p.process(&once, &resolver);
        assert_eq!(once, twice);
    }

    #[test]
    fn dollar_jsonpath_is_not_a_token() {
        let p = processor();
        assert_eq!(p.process("$.token[0]", &resolver), "$.token[0]");
    }

    #[test]
    fn unclosed_token_passes_through() {
        let p = processor();
        assert_eq!(p.process("oops {{token", &resolver), "oops {{token");
    }

    #[test]
    fn whitespace_inside_token_is_tolerated() {
        let p = processor();
        assert_eq!(p.process("{{ token }}", &resolver), "T-42");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn uuid_helper_produces_valid_uuid() {
        let p = processor();
        let out = p.process("{{uuid}}", &resolver);
        assert!(uuid::Uuid::parse_str(&out).is_ok());
    }

    #[test]
    fn now_helper_produces_epoch_millis() {
        let p = processor();
        let out = p.process("{{now}}", &resolver);
        let ts: i64 = out.parse().unwrap();
        assert!(ts > 1_600_000_000_000);
    }

    #[test]
    fn random_int_helper_respects_bounds() {
        let p = processor();
        for _ in 0..50 {
            let out = p.process("{{randomInt(1, 6)}}", &resolver);
            let n: i64 = out.parse().unwrap();
            assert!((1..=6).contains(&n));
        }
    }

    #[test]
    fn random_int_with_bad_args_stays_literal() {
        let p = processor();
        assert_eq!(
            p.process("{{randomInt(6, 1)}}", &resolver),
            "{{randomInt(6, 1)}}"
        );
    }

    #[test]
    fn helper_shadows_variable_of_same_name() {
        let p = processor();
        let shadowing = |name: &str| -> Option<Value> {
            if name == "uuid" {
                Some(json!("not-a-uuid"))
            } else {
                None
            }
        };
        let out = p.process("{{uuid}}", &shadowing);
        assert!(uuid::Uuid::parse_str(&out).is_ok());
    }

    // -----------------------------------------------------------------------
    // Faker
    // -----------------------------------------------------------------------

    #[test]
    fn faker_email_token() {
        let p = processor();
        let out = p.process("{{faker.internet.email}}", &resolver);
        assert!(out.contains('@'));
    }

    #[test]
    fn faker_seeded_is_reproducible() {
        let a = TemplateProcessor::new(Some(123), None);
        let b = TemplateProcessor::new(Some(123), None);
        assert_eq!(
            a.process("{{faker.person.first_name}}", &resolver),
            b.process("{{faker.person.first_name}}", &resolver)
        );
    }

    #[test]
    fn faker_with_args() {
        let p = processor();
        let out = p.process("{{faker.number.int(10, 20)}}", &resolver);
        let n: i64 = out.parse().unwrap();
        assert!((10..=20).contains(&n));
    }

    #[test]
    fn unknown_faker_method_stays_literal() {
        let p = processor();
        assert_eq!(
            p.process("{{faker.person.unknown}}", &resolver),
            "{{faker.person.unknown}}"
        );
    }

    // -----------------------------------------------------------------------
    // Step processing
    // -----------------------------------------------------------------------

    #[test]
    fn process_step_substitutes_into_url_and_headers() {
        let p = processor();
        let step: Step = serde_json::from_str(
            r#"{
                "name": "me",
                "type": "rest",
                "url": "http://{{variables.host}}/me",
                "headers": {"Authorization": "Bearer {{token}}"}
            }"#,
        )
        .unwrap();
        let processed = p.process_step(&step, &resolver).unwrap();
        match &processed.action {
            crate::model::StepAction::Rest { url, headers, .. } => {
                assert_eq!(url, "http://example.com/me");
                assert_eq!(headers["Authorization"], "Bearer T-42");
            }
            other => panic!("expected rest step, got {other:?}"),
        }
    }

    #[test]
    fn process_step_escapes_values_with_quotes() {
        let p = processor();
        let step: Step = serde_json::from_str(
            r#"{"name": "post", "type": "rest", "url": "http://x", "body": "msg: {{quote}}"}"#,
        )
        .unwrap();
        // The substituted value contains a double quote; the re-parse must
        // still succeed and carry the literal character.
        let processed = p.process_step(&step, &resolver).unwrap();
        match &processed.action {
            crate::model::StepAction::Rest { body, .. } => {
                assert_eq!(body.as_deref(), Some("msg: say \"hi\""));
            }
            other => panic!("expected rest step, got {other:?}"),
        }
    }
}
