use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub mod diagram;
pub mod validate;

pub use validate::{DefinitionError, ValidatedWorkflow};

/// When the owning trigger fires the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TriggerKind {
    #[default]
    Never,
    #[serde(rename = "API call")]
    ApiCall,
    Insert,
    Update,
    Delete,
    Daily,
    Hourly,
    Weekly,
}

/// A workflow definition: an ordered set of steps owned by a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            trigger: TriggerKind::Never,
            steps,
        }
    }

    /// Hash the definition to create a version identifier
    ///
    /// Runs record the hash of the definition they started under, so a
    /// resume against a changed definition can be detected.
    pub fn version_hash(&self) -> String {
        let canonical = serde_json::to_string(&self.steps).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// One unit of workflow execution
///
/// Serializes to the wire shape the copilot emits:
/// `{name, type, configuration: {...}, next_step, only_if, initial_step}`.
/// `next_step` is either empty (fall through in definition order, terminate
/// if last), the literal name of another step, or an expression over the
/// context that evaluates to a step name.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub config: StepConfig,
    pub next_step: Option<String>,
    pub only_if: Option<String>,
    pub initial_step: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, config: StepConfig) -> Self {
        Self {
            name: name.into(),
            config,
            next_step: None,
            only_if: None,
            initial_step: false,
        }
    }

    pub fn next_step(mut self, next: impl Into<String>) -> Self {
        self.next_step = Some(next.into());
        self
    }

    pub fn only_if(mut self, guard: impl Into<String>) -> Self {
        self.only_if = Some(guard.into());
        self
    }

    pub fn initial(mut self) -> Self {
        self.initial_step = true;
        self
    }
}

/// Type-specific step configuration
///
/// The nine built-in kinds are a closed enum; anything else the definition
/// names is carried as `Custom` and dispatched through the engine's
/// registered-handler map.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    Code(CodeConfig),
    Form(FormConfig),
    Output(OutputConfig),
    AskAi(AskAiConfig),
    Extract(ExtractConfig),
    Retrieve(RetrieveConfig),
    ForLoop(ForLoopConfig),
    EndForLoop,
    Stop,
    Custom {
        action: String,
        configuration: JsonValue,
    },
}

impl StepConfig {
    /// The `type` string used on the wire
    pub fn type_name(&self) -> &str {
        match self {
            StepConfig::Code(_) => "Code",
            StepConfig::Form(_) => "Form",
            StepConfig::Output(_) => "Output",
            StepConfig::AskAi(_) => "AskAI",
            StepConfig::Extract(_) => "Extract",
            StepConfig::Retrieve(_) => "Retrieve",
            StepConfig::ForLoop(_) => "ForLoop",
            StepConfig::EndForLoop => "EndForLoop",
            StepConfig::Stop => "Stop",
            StepConfig::Custom { action, .. } => action,
        }
    }
}

/// Code step: a snippet evaluated with the context in scope, returning an
/// object merged into the context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeConfig {
    pub code: String,
}

/// Form step: questions rendered by the form surface while the run is
/// suspended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_title: Option<String>,
    pub form_questions: Vec<FormQuestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormQuestion {
    pub question_title: String,
    pub question_type: QuestionKind,
    pub variable_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multiple_choice_answer: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    #[serde(rename = "Yes/No")]
    YesNo,
    #[serde(rename = "Free text")]
    FreeText,
    #[serde(rename = "Multiple choice")]
    MultipleChoice,
    Integer,
}

/// Output step: html with `{{ var }}` interpolation and/or a table expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskAiConfig {
    pub ask_question_expression: String,
    pub answer_variable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub extract_from_string_expression: String,
    pub extract_description: String,
    #[serde(default)]
    pub extract_fields: Vec<ExtractField>,
    #[serde(default)]
    pub extract_multiple: bool,
    pub extract_to_variable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveConfig {
    pub retrieve_term_expression: String,
    pub retrieve_to_variable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForLoopConfig {
    pub for_loop_array_expression: String,
    pub for_loop_step_name: String,
    pub for_loop_variable: String,
}

/// Wire shape for a step, used by the manual Serialize/Deserialize impls
#[derive(Serialize, Deserialize)]
struct RawStep {
    name: String,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    configuration: JsonValue,
    #[serde(default)]
    next_step: Option<String>,
    #[serde(default)]
    only_if: Option<String>,
    #[serde(default)]
    initial_step: bool,
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = RawStep::deserialize(deserializer)?;
        let parse = |cfg: JsonValue| {
            if cfg.is_null() {
                JsonValue::Object(serde_json::Map::new())
            } else {
                cfg
            }
        };
        let cfg = parse(raw.configuration);
        let config = match raw.step_type.as_str() {
            "Code" => StepConfig::Code(serde_json::from_value(cfg).map_err(D::Error::custom)?),
            "Form" => StepConfig::Form(serde_json::from_value(cfg).map_err(D::Error::custom)?),
            "Output" => StepConfig::Output(serde_json::from_value(cfg).map_err(D::Error::custom)?),
            "AskAI" => StepConfig::AskAi(serde_json::from_value(cfg).map_err(D::Error::custom)?),
            "Extract" => {
                StepConfig::Extract(serde_json::from_value(cfg).map_err(D::Error::custom)?)
            }
            "Retrieve" => {
                StepConfig::Retrieve(serde_json::from_value(cfg).map_err(D::Error::custom)?)
            }
            "ForLoop" => {
                StepConfig::ForLoop(serde_json::from_value(cfg).map_err(D::Error::custom)?)
            }
            "EndForLoop" => StepConfig::EndForLoop,
            "Stop" => StepConfig::Stop,
            other => StepConfig::Custom {
                action: other.to_string(),
                configuration: cfg,
            },
        };

        // Empty strings on the wire mean "not set"
        let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());

        Ok(Step {
            name: raw.name,
            config,
            next_step: non_empty(raw.next_step),
            only_if: non_empty(raw.only_if),
            initial_step: raw.initial_step,
        })
    }
}

impl Serialize for Step {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error;

        let configuration = match &self.config {
            StepConfig::Code(c) => serde_json::to_value(c).map_err(S::Error::custom)?,
            StepConfig::Form(c) => serde_json::to_value(c).map_err(S::Error::custom)?,
            StepConfig::Output(c) => serde_json::to_value(c).map_err(S::Error::custom)?,
            StepConfig::AskAi(c) => serde_json::to_value(c).map_err(S::Error::custom)?,
            StepConfig::Extract(c) => serde_json::to_value(c).map_err(S::Error::custom)?,
            StepConfig::Retrieve(c) => serde_json::to_value(c).map_err(S::Error::custom)?,
            StepConfig::ForLoop(c) => serde_json::to_value(c).map_err(S::Error::custom)?,
            StepConfig::EndForLoop | StepConfig::Stop => {
                JsonValue::Object(serde_json::Map::new())
            }
            StepConfig::Custom { configuration, .. } => configuration.clone(),
        };

        let raw = RawStep {
            name: self.name.clone(),
            step_type: self.config.type_name().to_string(),
            configuration,
            next_step: self.next_step.clone(),
            only_if: self.only_if.clone(),
            initial_step: self.initial_step,
        };
        raw.serialize(serializer)
    }
}
