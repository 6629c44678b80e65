use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::workflow::Workflow;

/// Lifecycle state of a workflow run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

/// Where execution stopped and why
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunError {
    pub step: String,
    pub message: String,
}

/// One active ForLoop iteration
///
/// Frames stack for nested loops; the innermost frame is last. `shadowed`
/// remembers the value the loop variable had before this loop bound it, so
/// popping the frame restores it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopFrame {
    pub items: Vec<JsonValue>,
    pub index: usize,
    pub variable: String,
    /// First step of the loop body
    pub body_step: String,
    /// The ForLoop step that opened this frame
    pub for_step: String,
    pub shadowed: Option<JsonValue>,
}

/// Content produced by an Output step, retained in run order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedOutput {
    pub step: String,
    pub html: String,
}

/// The complete durable state of one workflow run
///
/// Everything the engine needs to resume after a suspension or crash is
/// here; the engine itself keeps nothing between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub workflow: Workflow,
    pub version_hash: String,
    pub status: RunStatus,
    /// Name of the step to execute next (or the suspended step)
    pub current_step: Option<String>,
    pub context: Map<String, JsonValue>,
    pub loop_stack: Vec<LoopFrame>,
    pub outputs: Vec<RenderedOutput>,
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh run positioned at the workflow's initial step
    pub fn new(run_id: impl Into<String>, workflow: Workflow, initial_step: &str) -> Self {
        let version_hash = workflow.version_hash();
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            workflow,
            version_hash,
            status: RunStatus::Running,
            current_step: Some(initial_step.to_string()),
            context: Map::new(),
            loop_stack: Vec::new(),
            outputs: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}
