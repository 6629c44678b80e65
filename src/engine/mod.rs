//! Workflow run engine
//!
//! Executes a validated workflow one step at a time against the run
//! context: evaluate the `only_if` guard, run the step's type-specific
//! action, resolve the successor, persist, repeat. A run stops by
//! suspending at a Form step, completing at Stop or past the last step,
//! failing, or being cancelled.
//!
//! The full [`RunState`] is saved after every step, not only at
//! suspension, so a crash between steps loses at most one step's effects
//! and any saved run can be picked up by a fresh process.

pub mod next_step;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clients::Clients;
use crate::expr::{self, Bindings};
use crate::store::RunStore;
use crate::types::{LoopFrame, RenderedOutput, RunError, RunState, RunStatus};
use crate::workflow::{DefinitionError, Step, StepConfig, ValidatedWorkflow, Workflow};

use next_step::{resolve, Successor};

/// Errors that prevent the engine from making a decision at all
///
/// Step-level failures (bad expressions, collaborator errors) do not show
/// up here: those fail the run, which is a normal engine outcome carried
/// in the returned [`RunState`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),
    #[error("no run with id '{0}'")]
    UnknownRun(String),
    #[error("run '{run_id}' is {status:?}, not suspended")]
    NotSuspended { run_id: String, status: RunStatus },
    #[error("run '{run_id}' has invalid stored state: {detail}")]
    CorruptRun { run_id: String, detail: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Where control goes after one step body has run
enum Control {
    /// Resolve the successor from the step at this index
    AdvanceFrom(usize),
    /// Jump straight to a named step, bypassing next_step resolution
    Jump(String),
    /// Suspend awaiting form input
    Suspend,
    /// Terminate the run successfully
    Complete,
}

/// A step body that could not do its work
///
/// Fails the run at that step; context as of the last successful step is
/// retained for diagnosis.
struct StepFailure(String);

impl StepFailure {
    fn msg(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<expr::ExprError> for StepFailure {
    fn from(err: expr::ExprError) -> Self {
        Self(err.to_string())
    }
}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{err:#}"))
    }
}

pub struct Engine {
    store: Arc<dyn RunStore>,
    clients: Clients,
}

impl Engine {
    pub fn new(store: Arc<dyn RunStore>, clients: Clients) -> Self {
        Self { store, clients }
    }

    /// Start a new run and drive it until it suspends or terminates
    pub async fn start(
        &self,
        workflow: Workflow,
        run_id: Option<String>,
        initial_context: Map<String, JsonValue>,
    ) -> Result<RunState, EngineError> {
        let validated = ValidatedWorkflow::validate(workflow)?;
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = RunState::new(
            run_id,
            validated.workflow().clone(),
            &validated.initial_step().name,
        );
        state.context = initial_context;

        info!(run_id = %state.run_id, workflow = %validated.name(), "starting run");
        self.store.create(&state).await?;
        self.drive(&validated, state).await
    }

    /// Resume a suspended run with the form's answers
    ///
    /// Only answers for variables the form declares are merged; the run
    /// continues at the Form step's successor.
    pub async fn resume(
        &self,
        run_id: &str,
        answers: Map<String, JsonValue>,
    ) -> Result<RunState, EngineError> {
        let mut state = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::UnknownRun(run_id.to_string()))?;

        if state.status != RunStatus::Suspended {
            return Err(EngineError::NotSuspended {
                run_id: run_id.to_string(),
                status: state.status,
            });
        }

        let validated = ValidatedWorkflow::validate(state.workflow.clone())?;
        let Some(current) = state.current_step.clone() else {
            return Err(EngineError::CorruptRun {
                run_id: run_id.to_string(),
                detail: "suspended with no current step".to_string(),
            });
        };
        let form_ix = validated
            .index_of(&current)
            .ok_or_else(|| EngineError::CorruptRun {
                run_id: run_id.to_string(),
                detail: format!("suspended at unknown step '{current}'"),
            })?;

        if let StepConfig::Form(form) = &validated.step_at(form_ix).config {
            for question in &form.form_questions {
                if let Some(answer) = answers.get(&question.variable_name) {
                    state
                        .context
                        .insert(question.variable_name.clone(), answer.clone());
                }
            }
        }

        info!(run_id = %state.run_id, step = %current, "resuming run");
        state.status = RunStatus::Running;
        match resolve(&validated, form_ix, &state.context) {
            Ok(Successor::Step(next)) => state.current_step = Some(next),
            Ok(Successor::Terminate) => state.current_step = None,
            Err(err) => {
                return self.fail(state, &current, err.to_string()).await;
            }
        }
        self.store.save(&state).await?;
        self.drive(&validated, state).await
    }

    /// Execute steps until the run suspends, terminates, fails or is
    /// cancelled, persisting after every transition
    async fn drive(
        &self,
        workflow: &ValidatedWorkflow,
        mut state: RunState,
    ) -> Result<RunState, EngineError> {
        loop {
            // An external cancel stops the run before the next step; work
            // already committed stays committed.
            if self.store.is_cancelled(&state.run_id).await? {
                info!(run_id = %state.run_id, "run cancelled");
                state.status = RunStatus::Cancelled;
                self.store.save(&state).await?;
                return Ok(state);
            }

            let Some(current) = state.current_step.clone() else {
                state.status = RunStatus::Completed;
                info!(run_id = %state.run_id, "run completed");
                self.store.save(&state).await?;
                return Ok(state);
            };
            let Some(ix) = workflow.index_of(&current) else {
                return self
                    .fail(state, &current, format!("no step named '{current}'"))
                    .await;
            };
            let step = workflow.step_at(ix);
            debug!(run_id = %state.run_id, step = %step.name, kind = %step.config.type_name(), "executing step");

            // A false guard skips the body but still resolves the successor
            let run_body = match self.guard_allows(step, &state.context) {
                Ok(allowed) => allowed,
                Err(failure) => return self.fail(state, &current, failure.0).await,
            };

            let control = if run_body {
                match self.execute_step(workflow, step, ix, &mut state).await {
                    Ok(control) => control,
                    Err(failure) => return self.fail(state, &current, failure.0).await,
                }
            } else {
                Control::AdvanceFrom(ix)
            };

            match control {
                Control::AdvanceFrom(from_ix) => {
                    match resolve(workflow, from_ix, &state.context) {
                        Ok(Successor::Step(next)) => state.current_step = Some(next),
                        Ok(Successor::Terminate) => state.current_step = None,
                        Err(err) => return self.fail(state, &current, err.to_string()).await,
                    }
                }
                Control::Jump(next) => state.current_step = Some(next),
                Control::Suspend => {
                    info!(run_id = %state.run_id, step = %current, "run suspended awaiting form input");
                    state.status = RunStatus::Suspended;
                    self.store.save(&state).await?;
                    return Ok(state);
                }
                Control::Complete => {
                    state.status = RunStatus::Completed;
                    state.current_step = None;
                    info!(run_id = %state.run_id, "run completed");
                    self.store.save(&state).await?;
                    return Ok(state);
                }
            }

            self.store.save(&state).await?;
        }
    }

    fn guard_allows(
        &self,
        step: &Step,
        context: &Map<String, JsonValue>,
    ) -> Result<bool, StepFailure> {
        let Some(guard) = &step.only_if else {
            return Ok(true);
        };
        let bindings = Bindings::from_context(context);
        let value = expr::eval_expression(guard, &bindings)?;
        Ok(expr::is_truthy(&value))
    }

    /// Run one step's type-specific action
    ///
    /// Context writes happen only after the action has fully succeeded, so
    /// a failed step never leaves a partial merge behind.
    async fn execute_step(
        &self,
        workflow: &ValidatedWorkflow,
        step: &Step,
        ix: usize,
        state: &mut RunState,
    ) -> Result<Control, StepFailure> {
        match &step.config {
            StepConfig::Code(code) => {
                let updates = self.clients.code_runner.run(&code.code, &state.context).await?;
                for (key, value) in updates {
                    state.context.insert(key, value);
                }
                Ok(Control::AdvanceFrom(ix))
            }

            StepConfig::Form(_) => Ok(Control::Suspend),

            StepConfig::Output(output) => {
                let bindings = Bindings::from_context(&state.context);
                let mut html = match &output.html {
                    Some(template) => expr::interpolate(template, &bindings)?,
                    None => String::new(),
                };
                if let Some(table_expr) = &output.table_expression {
                    let rows = expr::eval_expression(table_expr, &bindings)?;
                    html.push_str(&render_table(&rows)?);
                }
                state.outputs.push(RenderedOutput {
                    step: step.name.clone(),
                    html,
                });
                Ok(Control::AdvanceFrom(ix))
            }

            StepConfig::AskAi(ask) => {
                let bindings = Bindings::from_context(&state.context);
                let question = expr::eval_expression(&ask.ask_question_expression, &bindings)?;
                let answer = self
                    .clients
                    .language_model
                    .complete(&expr::display(&question))
                    .await?;
                state
                    .context
                    .insert(ask.answer_variable.clone(), JsonValue::String(answer));
                Ok(Control::AdvanceFrom(ix))
            }

            StepConfig::Extract(extract) => {
                let bindings = Bindings::from_context(&state.context);
                let text =
                    expr::eval_expression(&extract.extract_from_string_expression, &bindings)?;
                let extracted = self
                    .clients
                    .language_model
                    .extract(
                        &extract.extract_description,
                        &expr::display(&text),
                        &extract.extract_fields,
                        extract.extract_multiple,
                    )
                    .await?;
                state
                    .context
                    .insert(extract.extract_to_variable.clone(), extracted);
                Ok(Control::AdvanceFrom(ix))
            }

            StepConfig::Retrieve(retrieve) => {
                let bindings = Bindings::from_context(&state.context);
                let term = expr::eval_expression(&retrieve.retrieve_term_expression, &bindings)?;
                let documents = self
                    .clients
                    .document_index
                    .search(&expr::display(&term))
                    .await?;

                // Append, never replace: repeated retrieves concatenate
                let entry = state
                    .context
                    .entry(retrieve.retrieve_to_variable.clone())
                    .or_insert_with(|| JsonValue::Array(Vec::new()));
                let JsonValue::Array(existing) = entry else {
                    return Err(StepFailure::msg(format!(
                        "variable '{}' already holds a non-array value",
                        retrieve.retrieve_to_variable
                    )));
                };
                for document in documents {
                    existing.push(serde_json::to_value(document).map_err(anyhow::Error::from)?);
                }
                Ok(Control::AdvanceFrom(ix))
            }

            StepConfig::ForLoop(cfg) => {
                let bindings = Bindings::from_context(&state.context);
                let items = expr::eval_expression(&cfg.for_loop_array_expression, &bindings)?;
                let JsonValue::Array(items) = items else {
                    return Err(StepFailure::msg(format!(
                        "for_loop_array_expression '{}' did not yield an array",
                        cfg.for_loop_array_expression
                    )));
                };

                // Empty sequence: skip the body entirely, the loop's own
                // next_step decides where to go
                if items.is_empty() {
                    return self.exit_loop(workflow, ix, &state.context);
                }

                let shadowed = state.context.get(&cfg.for_loop_variable).cloned();
                state
                    .context
                    .insert(cfg.for_loop_variable.clone(), items[0].clone());
                state.loop_stack.push(LoopFrame {
                    items,
                    index: 0,
                    variable: cfg.for_loop_variable.clone(),
                    body_step: cfg.for_loop_step_name.clone(),
                    for_step: step.name.clone(),
                    shadowed,
                });
                Ok(Control::Jump(cfg.for_loop_step_name.clone()))
            }

            StepConfig::EndForLoop => {
                let Some(frame) = state.loop_stack.last_mut() else {
                    return Err(StepFailure::msg("EndForLoop with no active loop"));
                };

                if frame.index + 1 < frame.items.len() {
                    frame.index += 1;
                    let value = frame.items[frame.index].clone();
                    let body = frame.body_step.clone();
                    let variable = frame.variable.clone();
                    state.context.insert(variable, value);
                    return Ok(Control::Jump(body));
                }

                // Exhausted: pop the frame, restore whatever the loop
                // variable shadowed, and continue from the ForLoop's own
                // next_step. The EndForLoop's next_step is ignored here.
                let frame = state
                    .loop_stack
                    .pop()
                    .ok_or_else(|| StepFailure::msg("EndForLoop with no active loop"))?;
                match frame.shadowed {
                    Some(previous) => {
                        state.context.insert(frame.variable.clone(), previous);
                    }
                    None => {
                        state.context.remove(&frame.variable);
                    }
                }
                let for_ix = workflow.index_of(&frame.for_step).ok_or_else(|| {
                    StepFailure::msg(format!(
                        "loop frame references unknown step '{}'",
                        frame.for_step
                    ))
                })?;
                self.exit_loop(workflow, for_ix, &state.context)
            }

            StepConfig::Stop => Ok(Control::Complete),

            StepConfig::Custom {
                action,
                configuration,
            } => {
                let handler = self.clients.action(action).ok_or_else(|| {
                    StepFailure::msg(format!("no handler registered for action '{action}'"))
                })?;
                let updates = handler.run(configuration, &state.context).await?;
                if let Some(updates) = updates {
                    for (key, value) in updates {
                        state.context.insert(key, value);
                    }
                }
                Ok(Control::AdvanceFrom(ix))
            }
        }
    }

    /// Where control goes when a loop is skipped or exhausted
    ///
    /// The ForLoop's own `next_step` decides if set; otherwise control
    /// proceeds past the matching EndForLoop in definition order. The
    /// EndForLoop's `next_step` is never consulted.
    fn exit_loop(
        &self,
        workflow: &ValidatedWorkflow,
        for_ix: usize,
        context: &Map<String, JsonValue>,
    ) -> Result<Control, StepFailure> {
        if workflow.step_at(for_ix).next_step.is_some() {
            return match resolve(workflow, for_ix, context) {
                Ok(Successor::Step(next)) => Ok(Control::Jump(next)),
                Ok(Successor::Terminate) => Ok(Control::Complete),
                Err(err) => Err(StepFailure(err.to_string())),
            };
        }
        let exit_ix = workflow.end_of_loop(for_ix).map_or(for_ix + 1, |end| end + 1);
        Ok(match workflow.steps().get(exit_ix) {
            Some(step) => Control::Jump(step.name.clone()),
            None => Control::Complete,
        })
    }

    async fn fail(
        &self,
        mut state: RunState,
        step: &str,
        message: String,
    ) -> Result<RunState, EngineError> {
        info!(run_id = %state.run_id, step = %step, error = %message, "run failed");
        state.status = RunStatus::Failed;
        state.error = Some(RunError {
            step: step.to_string(),
            message,
        });
        self.store.save(&state).await?;
        Ok(state)
    }
}

/// Render an array of objects as an HTML table
///
/// Column order follows the first row's keys; later rows contribute only
/// values for those columns.
fn render_table(rows: &JsonValue) -> Result<String, StepFailure> {
    let JsonValue::Array(rows) = rows else {
        return Err(StepFailure::msg(
            "table_expression did not yield an array".to_string(),
        ));
    };
    let Some(JsonValue::Object(first)) = rows.first() else {
        return Ok("<table></table>".to_string());
    };

    let columns: Vec<&String> = first.keys().collect();
    let mut html = String::from("<table><thead><tr>");
    for column in &columns {
        html.push_str(&format!("<th>{column}</th>"));
    }
    html.push_str("</tr></thead><tbody>");
    for row in rows {
        html.push_str("<tr>");
        for column in &columns {
            let cell = row.get(column.as_str()).unwrap_or(&JsonValue::Null);
            html.push_str(&format!("<td>{}</td>", expr::display(cell)));
        }
        html.push_str("</tr>");
    }
    html.push_str("</tbody></table>");
    Ok(html)
}
