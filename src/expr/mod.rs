//! Workflow expression language
//!
//! next_step expressions, only_if guards, Output table expressions and
//! Code snippets all share one small JS-flavoured expression language over
//! JSON values: literals, arrays and object literals, member access,
//! arithmetic, comparison, logical operators and the ternary conditional.
//!
//! Evaluation is AST-based against an explicit per-call [`Bindings`] table,
//! never by extending any ambient scope.

mod eval;
mod parser;


pub use eval::{display, evaluate, is_truthy, Bindings};
pub use parser::{identifiers, parse_expression, parse_snippet, Expr};

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Expression syntax or evaluation failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("type error: {0}")]
    Type(String),
}

/// Parse and evaluate an expression source string
pub fn eval_expression(source: &str, bindings: &Bindings) -> Result<JsonValue, ExprError> {
    let expr = parse_expression(source)?;
    evaluate(&expr, bindings)
}

/// Parse and evaluate a Code snippet (optional leading `return`)
pub fn eval_snippet(source: &str, bindings: &Bindings) -> Result<JsonValue, ExprError> {
    let expr = parse_snippet(source)?;
    evaluate(&expr, bindings)
}

/// Substitute `{{ expr }}` placeholders in a template
///
/// Each placeholder is evaluated against the bindings and stringified
/// with [`display`]. Text outside placeholders passes through untouched.
pub fn interpolate(template: &str, bindings: &Bindings) -> Result<String, ExprError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(ExprError::Parse("unterminated '{{' in template".to_string()));
        };
        let value = eval_expression(after[..end].trim(), bindings)?;
        out.push_str(&display(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
