//! Check engine — evaluates response assertions during a test run.

use std::collections::HashMap;

use serde_json::Value;

use crate::extract::json_path;
use crate::model::{Check, ResponseTimeBound};

// ---------------------------------------------------------------------------
// CheckContext / CheckOutcome
// ---------------------------------------------------------------------------

/// The parts of a step result a check can read.
pub struct CheckContext<'a> {
    pub status: u16,
    /// Response headers with lowercased names.
    pub headers: &'a HashMap<String, String>,
    pub body: &'a str,
    pub response_time_ms: u64,
}

/// Result of evaluating a single check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub passed: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a single check against the response context. Never panics.
pub fn evaluate_check(
    check: &Check,
    ctx: &CheckContext,
    resolver: &dyn Fn(&str) -> Option<Value>,
) -> CheckOutcome {
    match check {
        Check::Status { expected } => {
            let passed = ctx.status == *expected;
            CheckOutcome {
                passed,
                message: if passed {
                    format!("status {} matches expected", ctx.status)
                } else {
                    format!("expected status {expected}, got {}", ctx.status)
                },
            }
        }

        Check::ResponseTime { value } => evaluate_response_time(value, ctx.response_time_ms),

        Check::JsonPath { expression, expected } => {
            match serde_json::from_str::<Value>(ctx.body) {
                Ok(json) => match (json_path(&json, expression), expected) {
                    (Some(actual), Some(expected)) if actual == expected => CheckOutcome {
                        passed: true,
                        message: format!("JSON path \"{expression}\" equals expected value"),
                    },
                    (Some(actual), Some(expected)) => CheckOutcome {
                        passed: false,
                        message: format!(
                            "JSON path \"{expression}\" expected {expected}, got {actual}"
                        ),
                    },
                    (Some(_), None) => CheckOutcome {
                        passed: true,
                        message: format!("JSON path \"{expression}\" resolved"),
                    },
                    (None, _) => CheckOutcome {
                        passed: false,
                        message: format!("JSON path \"{expression}\" not found in response"),
                    },
                },
                Err(e) => CheckOutcome {
                    passed: false,
                    message: format!("failed to parse response as JSON: {e}"),
                },
            }
        }

        Check::TextContains { text } => {
            let passed = ctx.body.contains(text.as_str());
            CheckOutcome {
                passed,
                message: if passed {
                    format!("body contains \"{text}\"")
                } else {
                    format!("body does not contain \"{text}\"")
                },
            }
        }

        Check::Custom { expression } => match crate::expr::evaluate_bool(expression, resolver) {
            Ok(passed) => CheckOutcome {
                passed,
                message: if passed {
                    format!("custom check \"{expression}\" passed")
                } else {
                    format!("custom check \"{expression}\" failed")
                },
            },
            Err(e) => CheckOutcome {
                passed: false,
                message: format!("custom check error: {e}"),
            },
        },
    }
}

/// A response-time bound is either a plain upper limit in milliseconds or a
/// `"<Nms"` / `">Nms"` shorthand.
fn evaluate_response_time(bound: &ResponseTimeBound, elapsed_ms: u64) -> CheckOutcome {
    let (passed, description) = match bound {
        ResponseTimeBound::Millis(limit) => (
            elapsed_ms <= *limit,
            format!("response time {elapsed_ms} ms <= {limit} ms"),
        ),
        ResponseTimeBound::Shorthand(s) => {
            let trimmed = s.trim();
            let parse_limit = |rest: &str| -> Option<u64> {
                rest.trim().trim_end_matches("ms").trim().parse().ok()
            };
            if let Some(rest) = trimmed.strip_prefix('<') {
                match parse_limit(rest) {
                    Some(limit) => (
                        elapsed_ms < limit,
                        format!("response time {elapsed_ms} ms < {limit} ms"),
                    ),
                    None => (false, format!("invalid response_time bound \"{s}\"")),
                }
            } else if let Some(rest) = trimmed.strip_prefix('>') {
                match parse_limit(rest) {
                    Some(limit) => (
                        elapsed_ms > limit,
                        format!("response time {elapsed_ms} ms > {limit} ms"),
                    ),
                    None => (false, format!("invalid response_time bound \"{s}\"")),
                }
            } else {
                match parse_limit(trimmed) {
                    Some(limit) => (
                        elapsed_ms <= limit,
                        format!("response time {elapsed_ms} ms <= {limit} ms"),
                    ),
                    None => (false, format!("invalid response_time bound \"{s}\"")),
                }
            }
        }
    };

    CheckOutcome {
        passed,
        message: if passed {
            description
        } else {
            format!("check failed: {description}")
        },
    }
}

/// Evaluate every check on a step. Returns the individual outcomes; the
/// caller joins failing descriptions into the result's error message.
pub fn evaluate_all(
    checks: &[Check],
    ctx: &CheckContext,
    resolver: &dyn Fn(&str) -> Option<Value>,
) -> Vec<CheckOutcome> {
    checks
        .iter()
        .map(|c| evaluate_check(c, ctx, resolver))
        .collect()
}

/// Join the messages of failed checks into one error string.
pub fn failure_message(outcomes: &[CheckOutcome]) -> Option<String> {
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| o.message.as_str())
        .collect();
    if failed.is_empty() {
        None
    } else {
        Some(failed.join("; "))
    }
}
