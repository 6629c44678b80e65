//! Static validation of workflow definitions
//!
//! Everything here is checked before a run starts. A workflow that fails
//! validation never executes, so the engine can assume unique step names,
//! a single well-defined initial step, resolvable loop bodies and matched
//! EndForLoop steps.

use std::collections::HashMap;

use thiserror::Error;

use super::{Step, StepConfig, Workflow};

/// Configuration errors detected at load/validation time
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("workflow has no steps")]
    Empty,
    #[error("duplicate step name '{0}'")]
    DuplicateStepName(String),
    #[error("step name '{0}' is not a valid identifier")]
    InvalidStepName(String),
    #[error("multiple steps marked as initial: '{first}' and '{second}'")]
    MultipleInitialSteps { first: String, second: String },
    #[error("ForLoop step '{step}' starts its body at '{target}', which is not a step in this workflow")]
    UnknownLoopBody { step: String, target: String },
    #[error("EndForLoop step '{0}' has no preceding unclosed ForLoop")]
    UnmatchedEndForLoop(String),
}

/// A workflow that has passed definition validation
///
/// Carries the name index, the initial step and the ForLoop/EndForLoop
/// pairing computed once here and reused by both the engine and the
/// diagram generator.
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    workflow: Workflow,
    version_hash: String,
    index_by_name: HashMap<String, usize>,
    initial: usize,
    /// EndForLoop index -> index of the ForLoop it closes
    loop_of_end: HashMap<usize, usize>,
    /// ForLoop index -> index of the EndForLoop that closes it, if any
    end_of_loop: HashMap<usize, usize>,
}

impl ValidatedWorkflow {
    /// Validate a workflow definition
    ///
    /// Checks, in order: non-empty, valid identifier step names, unique
    /// names, at most one explicit initial step (the first step is initial
    /// when none is marked), ForLoop body targets resolve, and every
    /// EndForLoop closes a preceding unclosed ForLoop. Loop pairing is
    /// standard bracket matching over definition order, so arbitrarily
    /// nested loops pair with the innermost open ForLoop.
    pub fn validate(workflow: Workflow) -> Result<Self, DefinitionError> {
        if workflow.steps.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut index_by_name = HashMap::new();
        for (ix, step) in workflow.steps.iter().enumerate() {
            if !is_identifier(&step.name) {
                return Err(DefinitionError::InvalidStepName(step.name.clone()));
            }
            if index_by_name.insert(step.name.clone(), ix).is_some() {
                return Err(DefinitionError::DuplicateStepName(step.name.clone()));
            }
        }

        let mut initial = None;
        for step in &workflow.steps {
            if step.initial_step {
                if let Some(first) = initial {
                    let first: &Step = &workflow.steps[first];
                    return Err(DefinitionError::MultipleInitialSteps {
                        first: first.name.clone(),
                        second: step.name.clone(),
                    });
                }
                initial = Some(index_by_name[&step.name]);
            }
        }
        let initial = initial.unwrap_or(0);

        let mut open_loops: Vec<usize> = Vec::new();
        let mut loop_of_end = HashMap::new();
        let mut end_of_loop = HashMap::new();
        for (ix, step) in workflow.steps.iter().enumerate() {
            match &step.config {
                StepConfig::ForLoop(cfg) => {
                    if !index_by_name.contains_key(&cfg.for_loop_step_name) {
                        return Err(DefinitionError::UnknownLoopBody {
                            step: step.name.clone(),
                            target: cfg.for_loop_step_name.clone(),
                        });
                    }
                    open_loops.push(ix);
                }
                StepConfig::EndForLoop => {
                    let Some(for_ix) = open_loops.pop() else {
                        return Err(DefinitionError::UnmatchedEndForLoop(step.name.clone()));
                    };
                    loop_of_end.insert(ix, for_ix);
                    end_of_loop.insert(for_ix, ix);
                }
                _ => {}
            }
        }
        // A ForLoop left open is allowed: its body may Stop or fall off the
        // end, terminating the run mid-iteration.

        let version_hash = workflow.version_hash();

        Ok(Self {
            workflow,
            version_hash,
            index_by_name,
            initial,
            loop_of_end,
            end_of_loop,
        })
    }

    pub fn name(&self) -> &str {
        &self.workflow.name
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn version_hash(&self) -> &str {
        &self.version_hash
    }

    pub fn steps(&self) -> &[Step] {
        &self.workflow.steps
    }

    pub fn step_at(&self, index: usize) -> &Step {
        &self.workflow.steps[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_by_name.get(name).copied()
    }

    pub fn initial_index(&self) -> usize {
        self.initial
    }

    pub fn initial_step(&self) -> &Step {
        &self.workflow.steps[self.initial]
    }

    /// The ForLoop closed by the EndForLoop at `end_index`
    pub fn for_loop_of(&self, end_index: usize) -> Option<usize> {
        self.loop_of_end.get(&end_index).copied()
    }

    /// The EndForLoop closing the ForLoop at `for_index`
    pub fn end_of_loop(&self, for_index: usize) -> Option<usize> {
        self.end_of_loop.get(&for_index).copied()
    }
}

/// Valid identifier: what the copilot is instructed to emit for step names
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
