//! Script executor — runs hook and script-step bodies written in the
//! embedded expression language, with an enforced deadline.
//!
//! A script is a sequence of statements separated by newlines or `;`:
//! `set name = expr` assigns into the VU's variables, a bare expression is
//! evaluated for validation. Execution yields between statements so the
//! deadline race can fire.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::clock::{with_deadline, DEFAULT_TIMEOUT};
use crate::error::StampedeError;
use crate::expr::{evaluate, parse_script, Statement};

/// Run a script against the VU's variable map. `extra` resolves names not
/// found in `vars` (`__VU`, `__ITER`, extracted data, response fields).
pub async fn run_script(
    script: &str,
    timeout: Option<Duration>,
    vars: &mut HashMap<String, Value>,
    extra: &(dyn Fn(&str) -> Option<Value> + Sync),
) -> Result<(), StampedeError> {
    let statements = parse_script(script)?;
    let deadline = timeout.unwrap_or(DEFAULT_TIMEOUT);

    with_deadline(
        async {
            for statement in statements {
                // Suspension point between statements.
                tokio::task::yield_now().await;
                match statement {
                    Statement::Set { name, expr } => {
                        let value = {
                            let resolver =
                                |ident: &str| resolve_ident(vars, extra, ident);
                            evaluate(&expr, &resolver)?
                        };
                        vars.insert(name, value);
                    }
                    Statement::Expr(expr) => {
                        let resolver = |ident: &str| resolve_ident(vars, extra, ident);
                        evaluate(&expr, &resolver)?;
                    }
                }
            }
            Ok(())
        },
        deadline,
    )
    .await?
}

/// Run a hook, logging failures instead of propagating them. Hook failures
/// never fail the enclosing step unless the step disallows errors — the
/// caller checks the returned flag in that case.
pub async fn run_hook(
    label: &str,
    script: &str,
    timeout: Option<Duration>,
    vars: &mut HashMap<String, Value>,
    extra: &(dyn Fn(&str) -> Option<Value> + Sync),
) -> bool {
    match run_script(script, timeout, vars, extra).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(hook = label, error = %e, "hook failed");
            false
        }
    }
}

/// Identifier resolution for script statements: the VU's variables first
/// (with an explicit `variables.` prefix also accepted), then the caller's
/// extra resolver.
fn resolve_ident(
    vars: &HashMap<String, Value>,
    extra: &(dyn Fn(&str) -> Option<Value> + Sync),
    ident: &str,
) -> Option<Value> {
    lookup_path(vars, ident)
        .or_else(|| {
            ident
                .strip_prefix("variables.")
                .and_then(|path| lookup_path(vars, path))
        })
        .or_else(|| extra(ident))
}

/// Resolve a possibly dotted name against a variable map: the full name
/// first, then the head segment with the tail descending into the value.
pub fn lookup_path(vars: &HashMap<String, Value>, name: &str) -> Option<Value> {
    if let Some(v) = vars.get(name) {
        return Some(v.clone());
    }
    let (head, tail) = name.split_once('.')?;
    let mut current = vars.get(head)?;
    for segment in tail.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_extra(_: &str) -> Option<Value> {
        None
    }

    #[tokio::test]
    async fn set_statement_writes_variable() {
        let mut vars = HashMap::new();
        run_script("set counter = 1 + 2", None, &mut vars, &no_extra)
            .await
            .unwrap();
        assert_eq!(vars["counter"], json!(3));
    }

    #[tokio::test]
    async fn statements_see_earlier_assignments() {
        let mut vars = HashMap::new();
        run_script(
            "set a = 2; set b = a * 10",
            None,
            &mut vars,
            &no_extra,
        )
        .await
        .unwrap();
        assert_eq!(vars["b"], json!(20));
    }

    #[tokio::test]
    async fn extra_resolver_supplies_specials() {
        let mut vars = HashMap::new();
        let extra = |name: &str| match name {
            "__VU" => Some(json!(4)),
            _ => None,
        };
        run_script("set tag = 'vu-' + __VU", None, &mut vars, &extra)
            .await
            .unwrap();
        assert_eq!(vars["tag"], json!("vu-4"));
    }

    #[tokio::test]
    async fn variables_shadow_extra_resolver() {
        let mut vars = HashMap::new();
        vars.insert("__VU".to_string(), json!(99));
        let extra = |name: &str| match name {
            "__VU" => Some(json!(4)),
            _ => None,
        };
        run_script("set tag = __VU", None, &mut vars, &extra)
            .await
            .unwrap();
        assert_eq!(vars["tag"], json!(99));
    }

    #[tokio::test]
    async fn bad_expression_is_an_error() {
        let mut vars = HashMap::new();
        let result = run_script("set x = 1 +", None, &mut vars, &no_extra).await;
        assert!(matches!(result, Err(StampedeError::Expression(_))));
    }

    #[tokio::test]
    async fn run_hook_swallows_failures() {
        let mut vars = HashMap::new();
        let ok = run_hook("before_step", "set x = 1 +", None, &mut vars, &no_extra).await;
        assert!(!ok);
        let ok = run_hook("before_step", "set x = 1", None, &mut vars, &no_extra).await;
        assert!(ok);
        assert_eq!(vars["x"], json!(1));
    }

    #[test]
    fn lookup_path_descends_into_objects() {
        let mut vars = HashMap::new();
        vars.insert("user".to_string(), json!({"profile": {"name": "ada"}}));
        assert_eq!(
            lookup_path(&vars, "user.profile.name"),
            Some(json!("ada"))
        );
        assert!(lookup_path(&vars, "user.profile.missing").is_none());
    }

    #[test]
    fn lookup_path_prefers_exact_key() {
        let mut vars = HashMap::new();
        vars.insert("a.b".to_string(), json!("flat"));
        vars.insert("a".to_string(), json!({"b": "nested"}));
        assert_eq!(lookup_path(&vars, "a.b"), Some(json!("flat")));
    }
}
