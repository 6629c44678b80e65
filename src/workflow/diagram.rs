//! Mermaid flowchart rendering of a workflow definition
//!
//! Produces a `flowchart TD` with one node per step and edges for every
//! way control can move: literal next_step targets, fallthrough to the
//! next step in definition order, step names referenced by a next_step
//! expression, ForLoop entry into its body, and EndForLoop back to the
//! ForLoop it closes.

use std::fmt::Write as _;

use crate::expr;

use super::{StepConfig, ValidatedWorkflow};

/// Render a validated workflow as a Mermaid flowchart
pub fn render(workflow: &ValidatedWorkflow) -> String {
    let steps = workflow.steps();
    let mut out = String::from("flowchart TD\n");

    for step in steps {
        // Markdown-string label: bold step name over its type
        let _ = writeln!(
            out,
            "  {name}[\"`**{name}**\n  {kind}`\"]:::wfstep",
            name = step.name,
            kind = step.config.type_name(),
        );
    }

    for (ix, step) in steps.iter().enumerate() {
        if let StepConfig::ForLoop(cfg) = &step.config {
            let _ = writeln!(out, "  {} --> {}", step.name, cfg.for_loop_step_name);
            continue;
        }

        // EndForLoop loops back to the ForLoop it closes; pairing comes
        // from validation, so nested loops point at the right one.
        if let StepConfig::EndForLoop = &step.config {
            if let Some(for_ix) = workflow.for_loop_of(ix) {
                let _ = writeln!(out, "  {} --> {}", step.name, steps[for_ix].name);
            }
            continue;
        }

        match &step.next_step {
            Some(target) if workflow.index_of(target).is_some() => {
                let _ = writeln!(out, "  {} --> {}", step.name, target);
            }
            Some(expression) => {
                // An expression: every step name it mentions is a
                // potential successor
                for name in expr::identifiers(expression) {
                    if workflow.index_of(&name).is_some() {
                        let _ = writeln!(out, "  {} --> {}", step.name, name);
                    }
                }
            }
            None => {
                if let Some(next) = steps.get(ix + 1) {
                    let _ = writeln!(out, "  {} --> {}", step.name, next.name);
                }
            }
        }
    }

    out
}
