//! Evaluator for the workflow expression language
//!
//! Expressions are evaluated against an explicit binding table assembled
//! per call (context entries, plus step-name self-bindings for next_step
//! expressions). There is no shared scope: whoever calls the evaluator
//! decides exactly which names are visible.

use serde_json::{Map, Number, Value as JsonValue};

use super::parser::{Accessor, BinaryOp, Expr, UnaryOp};
use super::ExprError;

/// Name -> value binding table for one evaluation
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: Map<String, JsonValue>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every context key by name, plus `context` for the whole bag
    ///
    /// A context value literally named `context` keeps its own binding; the
    /// whole-bag alias only fills the gap when the name is free.
    pub fn from_context(context: &Map<String, JsonValue>) -> Self {
        let mut bindings = Self::new();
        for (key, value) in context {
            bindings.values.insert(key.clone(), value.clone());
        }
        if !bindings.values.contains_key("context") {
            bindings
                .values
                .insert("context".to_string(), JsonValue::Object(context.clone()));
        }
        bindings
    }

    pub fn bind(&mut self, name: impl Into<String>, value: JsonValue) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }
}

/// Evaluate a parsed expression against the bindings
pub fn evaluate(expr: &Expr, bindings: &Bindings) -> Result<JsonValue, ExprError> {
    match expr {
        Expr::Null => Ok(JsonValue::Null),
        Expr::Bool(b) => Ok(JsonValue::Bool(*b)),
        Expr::Number(n) => Ok(number_value(*n)),
        Expr::Str(s) => Ok(JsonValue::String(s.clone())),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(item, bindings)?);
            }
            Ok(JsonValue::Array(out))
        }
        Expr::Object(pairs) => {
            let mut out = Map::new();
            for (key, value) in pairs {
                out.insert(key.clone(), evaluate(value, bindings)?);
            }
            Ok(JsonValue::Object(out))
        }
        Expr::Ident(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
        Expr::Member { object, accessor } => {
            let object = evaluate(object, bindings)?;
            access(&object, accessor, bindings)
        }
        Expr::Unary { op, operand } => {
            let operand = evaluate(operand, bindings)?;
            match op {
                UnaryOp::Not => Ok(JsonValue::Bool(!is_truthy(&operand))),
                UnaryOp::Neg => match operand.as_f64() {
                    Some(n) => Ok(number_value(-n)),
                    None => Err(ExprError::Type(format!(
                        "cannot negate {}",
                        type_name(&operand)
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => evaluate_binary(*op, left, right, bindings),
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => {
            if is_truthy(&evaluate(condition, bindings)?) {
                evaluate(then, bindings)
            } else {
                evaluate(otherwise, bindings)
            }
        }
    }
}

fn evaluate_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    bindings: &Bindings,
) -> Result<JsonValue, ExprError> {
    // Short-circuit logical operators before evaluating the right side
    match op {
        BinaryOp::And => {
            let left = evaluate(left, bindings)?;
            if !is_truthy(&left) {
                return Ok(JsonValue::Bool(false));
            }
            let right = evaluate(right, bindings)?;
            return Ok(JsonValue::Bool(is_truthy(&right)));
        }
        BinaryOp::Or => {
            let left = evaluate(left, bindings)?;
            if is_truthy(&left) {
                return Ok(JsonValue::Bool(true));
            }
            let right = evaluate(right, bindings)?;
            return Ok(JsonValue::Bool(is_truthy(&right)));
        }
        _ => {}
    }

    let left = evaluate(left, bindings)?;
    let right = evaluate(right, bindings)?;

    match op {
        BinaryOp::Add => {
            // String + anything concatenates, as in the JS expressions the
            // copilot writes ("prefix " + term)
            if left.is_string() || right.is_string() {
                return Ok(JsonValue::String(format!(
                    "{}{}",
                    display(&left),
                    display(&right)
                )));
            }
            numeric(op, &left, &right, |l, r| Some(number_value(l + r)))
        }
        BinaryOp::Sub => numeric(op, &left, &right, |l, r| Some(number_value(l - r))),
        BinaryOp::Mul => numeric(op, &left, &right, |l, r| Some(number_value(l * r))),
        BinaryOp::Div => numeric(op, &left, &right, |l, r| {
            if r == 0.0 {
                Some(JsonValue::Null)
            } else {
                Some(number_value(l / r))
            }
        }),
        BinaryOp::Rem => numeric(op, &left, &right, |l, r| {
            if r == 0.0 {
                Some(JsonValue::Null)
            } else {
                Some(number_value(l % r))
            }
        }),
        BinaryOp::Eq => Ok(JsonValue::Bool(loose_eq(&left, &right))),
        BinaryOp::Ne => Ok(JsonValue::Bool(!loose_eq(&left, &right))),
        BinaryOp::Lt => Ok(JsonValue::Bool(compare(&left, &right, |o| {
            o == std::cmp::Ordering::Less
        }))),
        BinaryOp::Gt => Ok(JsonValue::Bool(compare(&left, &right, |o| {
            o == std::cmp::Ordering::Greater
        }))),
        BinaryOp::Le => Ok(JsonValue::Bool(compare(&left, &right, |o| {
            o != std::cmp::Ordering::Greater
        }))),
        BinaryOp::Ge => Ok(JsonValue::Bool(compare(&left, &right, |o| {
            o != std::cmp::Ordering::Less
        }))),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn numeric<F>(
    op: BinaryOp,
    left: &JsonValue,
    right: &JsonValue,
    f: F,
) -> Result<JsonValue, ExprError>
where
    F: Fn(f64, f64) -> Option<JsonValue>,
{
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => Ok(f(l, r).unwrap_or(JsonValue::Null)),
        _ => Err(ExprError::Type(format!(
            "cannot apply {:?} to {} and {}",
            op,
            type_name(left),
            type_name(right)
        ))),
    }
}

/// Member access, null-safe: missing properties and out-of-range indexes
/// yield null rather than an error
fn access(
    object: &JsonValue,
    accessor: &Accessor,
    bindings: &Bindings,
) -> Result<JsonValue, ExprError> {
    let value = match accessor {
        Accessor::Field(field) => object.get(field.as_str()).cloned(),
        Accessor::Index(index) => {
            let index = evaluate(index, bindings)?;
            match &index {
                JsonValue::String(key) => object.get(key.as_str()).cloned(),
                JsonValue::Number(n) => match n.as_u64() {
                    Some(ix) => object.get(ix as usize).cloned(),
                    None => None,
                },
                _ => None,
            }
        }
    };
    Ok(value.unwrap_or(JsonValue::Null))
}

/// Equality with numeric coercion, so `3 == 3.0` holds regardless of how
/// the number entered the context
fn loose_eq(left: &JsonValue, right: &JsonValue) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Ordering comparison: numbers numerically, strings lexicographically,
/// anything else is never ordered
fn compare<F>(left: &JsonValue, right: &JsonValue, f: F) -> bool
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l.partial_cmp(&r).map(&f).unwrap_or(false);
    }
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return f(l.cmp(r));
    }
    false
}

/// JS-style truthiness: false, null, 0 and "" are falsy
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

/// Keep integral results as JSON integers so contexts stay tidy
fn number_value(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        JsonValue::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// Stringify a value for concatenation and `{{ var }}` interpolation
pub fn display(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null".to_string(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
