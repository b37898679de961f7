use std::collections::HashMap;

use serde_json::Value;

use super::ast::{BinOp, Expr};

/// Read-only view of the execution state an expression may see.
pub struct EvalContext<'a> {
    /// The execution's input payload (`input.*`).
    pub input: &'a Value,
    /// Outputs of completed nodes, by node id (`output.<node>.*`).
    pub outputs: &'a HashMap<String, Value>,
    /// User scratch carried through the execution (`context.*`).
    pub scratch: &'a Value,
    /// Loop index; `None` outside a loop body.
    pub iteration: Option<u32>,
}

impl Expr {
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Value, String> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(segments) => resolve_path(segments, ctx),
            Expr::Not(inner) => match inner.eval(ctx)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(format!("`not` requires a boolean, got {other}")),
            },
            Expr::Neg(inner) => {
                let n = as_number(&inner.eval(ctx)?, "unary `-`")?;
                Ok(number(-n))
            }
            Expr::Binary(op, left, right) => eval_binary(*op, left, right, ctx),
        }
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, ctx: &EvalContext<'_>) -> Result<Value, String> {
    // Logical operators short-circuit; everything else is strict.
    match op {
        BinOp::And => {
            return match left.eval(ctx)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => match right.eval(ctx)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(format!("`and` requires booleans, got {other}")),
                },
                other => Err(format!("`and` requires booleans, got {other}")),
            };
        }
        BinOp::Or => {
            return match left.eval(ctx)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => match right.eval(ctx)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(format!("`or` requires booleans, got {other}")),
                },
                other => Err(format!("`or` requires booleans, got {other}")),
            };
        }
        _ => {}
    }

    let lhs = left.eval(ctx)?;
    let rhs = right.eval(ctx)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(json_eq(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Bool(!json_eq(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let l = as_number(&lhs, op.symbol())?;
            let r = as_number(&rhs, op.symbol())?;
            let result = match op {
                BinOp::Lt => l < r,
                BinOp::Le => l <= r,
                BinOp::Gt => l > r,
                BinOp::Ge => l >= r,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::In => membership(&lhs, &rhs),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let l = as_number(&lhs, op.symbol())?;
            let r = as_number(&rhs, op.symbol())?;
            let result = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => {
                    if r == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    l / r
                }
                _ => unreachable!(),
            };
            Ok(number(result))
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

/// `needle in haystack`: array containment, substring, or object key.
fn membership(needle: &Value, haystack: &Value) -> Result<Value, String> {
    match haystack {
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|v| json_eq(v, needle)))),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(Value::Bool(s.contains(sub.as_str()))),
            other => Err(format!("`in` over a string requires a string, got {other}")),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
            other => Err(format!("`in` over an object requires a string key, got {other}")),
        },
        other => Err(format!("`in` requires an array, string or object, got {other}")),
    }
}

fn resolve_path(segments: &[String], ctx: &EvalContext<'_>) -> Result<Value, String> {
    let (root, rest) = segments.split_first().expect("parser produces non-empty paths");
    match root.as_str() {
        "input" => descend(ctx.input, rest, "input"),
        "context" => descend(ctx.scratch, rest, "context"),
        "iteration" => {
            if !rest.is_empty() {
                return Err("`iteration` has no fields".to_string());
            }
            match ctx.iteration {
                Some(i) => Ok(Value::from(i)),
                None => Err("`iteration` is only bound inside a loop body".to_string()),
            }
        }
        "output" => {
            let (node_id, path) = rest
                .split_first()
                .ok_or_else(|| "`output` requires a node id, e.g. output.step.field".to_string())?;
            let node_output = ctx
                .outputs
                .get(node_id)
                .ok_or_else(|| format!("no completed output for node `{node_id}`"))?;
            descend(node_output, path, node_id)
        }
        other => Err(format!(
            "unknown variable `{other}`; expected input, output, context or iteration"
        )),
    }
}

fn descend(mut value: &Value, path: &[String], root: &str) -> Result<Value, String> {
    for segment in path {
        match value {
            Value::Object(map) => {
                value = map
                    .get(segment)
                    .ok_or_else(|| format!("field `{segment}` not found under `{root}`"))?;
            }
            other => {
                return Err(format!(
                    "cannot access field `{segment}` on non-object value {other}"
                ))
            }
        }
    }
    Ok(value.clone())
}

/// Numeric equality is value-based (1 == 1.0); everything else is structural.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn as_number(v: &Value, op: &str) -> Result<f64, String> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("number out of range in `{op}`")),
        other => Err(format!("`{op}` requires numbers, got {other}")),
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
