//! Guarded-expression evaluator for control-flow nodes.
//!
//! The language is deliberately tiny and pure: comparisons, boolean logic,
//! arithmetic, membership and dotted field access over the execution state.
//! No function calls, no assignment, no I/O. Parse or resolution failures
//! surface as `EngineError::Expression` and fail the host node.
//!
//! Exposed variables:
//!
//! - `input.*` — the execution input
//! - `output.<node_id>.*` — the output of any completed node
//! - `context.*` — user-writable scratch carried through the execution
//! - `iteration` — current loop index, bound only inside a loop body

mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::Expr;
pub use eval::EvalContext;

use crate::error::EngineError;

/// Parse an expression. The returned AST is immutable and reusable.
pub fn parse(source: &str) -> Result<Expr, EngineError> {
    let tokens = lexer::tokenize(source).map_err(|reason| EngineError::Expression {
        expr: source.to_string(),
        reason,
    })?;
    parser::parse(&tokens).map_err(|reason| EngineError::Expression {
        expr: source.to_string(),
        reason,
    })
}

/// Parse and evaluate in one step, as the orchestrator does for node guards.
pub fn evaluate(source: &str, ctx: &EvalContext<'_>) -> Result<serde_json::Value, EngineError> {
    let expr = parse(source)?;
    expr.eval(ctx).map_err(|reason| EngineError::Expression {
        expr: source.to_string(),
        reason,
    })
}

/// Evaluate an expression that must produce a boolean.
pub fn evaluate_bool(source: &str, ctx: &EvalContext<'_>) -> Result<bool, EngineError> {
    match evaluate(source, ctx)? {
        serde_json::Value::Bool(b) => Ok(b),
        other => Err(EngineError::Expression {
            expr: source.to_string(),
            reason: format!("expected a boolean, got {other}"),
        }),
    }
}

/// Evaluate an expression that must produce a number (used by `best_by`).
pub fn evaluate_number(source: &str, ctx: &EvalContext<'_>) -> Result<f64, EngineError> {
    match evaluate(source, ctx)? {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| EngineError::Expression {
            expr: source.to_string(),
            reason: "number out of range".to_string(),
        }),
        other => Err(EngineError::Expression {
            expr: source.to_string(),
            reason: format!("expected a number, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx<'a>(
        input: &'a serde_json::Value,
        outputs: &'a HashMap<String, serde_json::Value>,
    ) -> EvalContext<'a> {
        EvalContext {
            input,
            outputs,
            scratch: &serde_json::Value::Null,
            iteration: None,
        }
    }

    #[test]
    fn comparisons_over_node_outputs() {
        let input = json!({"x": 1});
        let mut outputs = HashMap::new();
        outputs.insert("classify".to_string(), json!({"score": 0.8}));
        let ctx = ctx(&input, &outputs);

        assert!(evaluate_bool("output.classify.score > 0.5", &ctx).unwrap());
        assert!(!evaluate_bool("output.classify.score >= 0.9", &ctx).unwrap());
        assert!(evaluate_bool("input.x = 1", &ctx).unwrap());
        assert!(evaluate_bool("input.x != 2", &ctx).unwrap());
    }

    #[test]
    fn boolean_logic_and_precedence() {
        let input = json!({"a": 1, "b": 2});
        let outputs = HashMap::new();
        let ctx = ctx(&input, &outputs);

        assert!(evaluate_bool("input.a = 1 and input.b = 2", &ctx).unwrap());
        assert!(evaluate_bool("input.a = 9 or input.b = 2", &ctx).unwrap());
        assert!(evaluate_bool("not (input.a = 9) and input.b + 1 = 3", &ctx).unwrap());
        // `and` binds tighter than `or`
        assert!(evaluate_bool("input.a = 9 and input.b = 9 or input.a = 1", &ctx).unwrap());
    }

    #[test]
    fn arithmetic() {
        let input = json!({"n": 6});
        let outputs = HashMap::new();
        let ctx = ctx(&input, &outputs);

        assert_eq!(evaluate("input.n * 2 + 1", &ctx).unwrap(), json!(13.0));
        assert_eq!(evaluate("(input.n - 2) / 2", &ctx).unwrap(), json!(2.0));
    }

    #[test]
    fn membership() {
        let input = json!({"tag": "b", "tags": ["a", "b"], "phrase": "hello world"});
        let outputs = HashMap::new();
        let ctx = ctx(&input, &outputs);

        assert!(evaluate_bool("input.tag in input.tags", &ctx).unwrap());
        assert!(evaluate_bool("'world' in input.phrase", &ctx).unwrap());
        assert!(!evaluate_bool("'z' in input.tags", &ctx).unwrap());
    }

    #[test]
    fn iteration_binding() {
        let input = json!({});
        let outputs = HashMap::new();
        let mut c = ctx(&input, &outputs);
        c.iteration = Some(2);
        assert!(!evaluate_bool("iteration >= 3", &c).unwrap());
        c.iteration = Some(3);
        assert!(evaluate_bool("iteration >= 3", &c).unwrap());
    }

    #[test]
    fn unresolved_variable_is_an_error() {
        let input = json!({});
        let outputs = HashMap::new();
        let ctx = ctx(&input, &outputs);

        let err = evaluate_bool("output.missing.score > 0", &ctx).unwrap_err();
        assert_eq!(err.kind(), "expression_error");
    }

    #[test]
    fn iteration_outside_loop_is_an_error() {
        let input = json!({});
        let outputs = HashMap::new();
        let ctx = ctx(&input, &outputs);
        assert!(evaluate_bool("iteration > 0", &ctx).is_err());
    }

    #[test]
    fn parse_failures_carry_the_source() {
        let err = parse("input.x >").unwrap_err();
        match err {
            EngineError::Expression { expr, .. } => assert_eq!(expr, "input.x >"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn string_equality() {
        let input = json!({"status": "approved"});
        let outputs = HashMap::new();
        let ctx = ctx(&input, &outputs);
        assert!(evaluate_bool("input.status = 'approved'", &ctx).unwrap());
        assert!(evaluate_bool("input.status != \"rejected\"", &ctx).unwrap());
    }

    #[test]
    fn division_by_zero() {
        let input = json!({"n": 1});
        let outputs = HashMap::new();
        let ctx = ctx(&input, &outputs);
        assert!(evaluate("input.n / 0", &ctx).is_err());
    }
}
