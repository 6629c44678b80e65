//! Successor resolution
//!
//! A step's `next_step` is resolved in a fixed order: empty means fall
//! through to the following step in definition order (or terminate if
//! last); an exact match against an existing step name always wins; only
//! then is the string treated as an expression. The literal-first rule is
//! load-bearing: human-readable step names can coincide with short valid
//! expressions, and which one wins must not depend on the context.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::expr::{self, Bindings, ExprError};
use crate::workflow::ValidatedWorkflow;

/// Where control goes after a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Successor {
    Step(String),
    Terminate,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    #[error("next_step expression failed: {0}")]
    Expression(#[from] ExprError),
    #[error("next_step expression '{expression}' resolved to '{resolved}', which is not a step")]
    NoSuchStep { expression: String, resolved: String },
    #[error("next_step expression '{expression}' resolved to a non-string value")]
    NotAName { expression: String },
}

/// Resolve the successor of the step at `from_index`
pub fn resolve(
    workflow: &ValidatedWorkflow,
    from_index: usize,
    context: &Map<String, JsonValue>,
) -> Result<Successor, ResolveError> {
    let step = workflow.step_at(from_index);

    let Some(target) = &step.next_step else {
        return Ok(match workflow.steps().get(from_index + 1) {
            Some(next) => Successor::Step(next.name.clone()),
            None => Successor::Terminate,
        });
    };

    if workflow.index_of(target).is_some() {
        return Ok(Successor::Step(target.clone()));
    }

    // Expression: context keys are addressable by name, and every step
    // name is bound to itself so `cond ? high : low` yields "high"
    // without quoting. Step names shadow context keys on collision.
    let mut bindings = Bindings::from_context(context);
    for other in workflow.steps() {
        bindings.bind(other.name.clone(), JsonValue::String(other.name.clone()));
    }

    let resolved = expr::eval_expression(target, &bindings)?;
    let JsonValue::String(name) = resolved else {
        return Err(ResolveError::NotAName {
            expression: target.clone(),
        });
    };

    if workflow.index_of(&name).is_none() {
        return Err(ResolveError::NoSuchStep {
            expression: target.clone(),
            resolved: name,
        });
    }
    Ok(Successor::Step(name))
}
