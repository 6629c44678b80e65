//! Collaborator interfaces the engine calls out to
//!
//! AskAI, Extract and Retrieve steps delegate to a language model and a
//! document index; Code steps delegate to a code runner; Custom steps
//! dispatch to registered action handlers. The engine only sees these
//! traits, so tests substitute scripted implementations and deployments
//! plug in real backends.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::expr::{self, Bindings};
use crate::workflow::ExtractField;

/// Chat-completion and structured-extraction backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-text answer to a prompt
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Extract the named fields from the text
    ///
    /// Returns an object with one entry per field, or an array of such
    /// objects when `multiple` is set.
    async fn extract(
        &self,
        description: &str,
        text: &str,
        fields: &[ExtractField],
        multiple: bool,
    ) -> Result<JsonValue>;
}

/// One hit from a document search
///
/// `title` and `url` are empty strings when the index has none, so the
/// documents serialized into the context keep a uniform shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedDocument {
    pub id: i64,
    pub contents: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// Semantic search over an external document collection
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<RetrievedDocument>>;
}

/// Executes a Code step's snippet against the run context
///
/// The returned object is merged shallowly into the context by the engine;
/// returning a non-object is the runner's error to report.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, code: &str, context: &Map<String, JsonValue>) -> Result<Map<String, JsonValue>>;
}

/// Default code runner: evaluates the snippet with the expression
/// language, stripping an optional leading `return`
#[derive(Debug, Default)]
pub struct ExprCodeRunner;

#[async_trait]
impl CodeRunner for ExprCodeRunner {
    async fn run(&self, code: &str, context: &Map<String, JsonValue>) -> Result<Map<String, JsonValue>> {
        let bindings = Bindings::from_context(context);
        let value = expr::eval_snippet(code, &bindings)?;
        match value {
            JsonValue::Object(map) => Ok(map),
            other => Err(anyhow!(
                "code step must return an object, got {}",
                expr::display(&other)
            )),
        }
    }
}

/// Handler for a Custom step's action
///
/// Returns context updates to merge, or None for a pure side effect.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(
        &self,
        configuration: &JsonValue,
        context: &Map<String, JsonValue>,
    ) -> Result<Option<Map<String, JsonValue>>>;
}

/// The collaborator bundle handed to the engine
#[derive(Clone)]
pub struct Clients {
    pub language_model: Arc<dyn LanguageModel>,
    pub document_index: Arc<dyn DocumentIndex>,
    pub code_runner: Arc<dyn CodeRunner>,
    actions: HashMap<String, Arc<dyn ActionHandler>>,
}

impl Clients {
    pub fn new(
        language_model: Arc<dyn LanguageModel>,
        document_index: Arc<dyn DocumentIndex>,
    ) -> Self {
        Self {
            language_model,
            document_index,
            code_runner: Arc::new(ExprCodeRunner),
            actions: HashMap::new(),
        }
    }

    pub fn with_code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.code_runner = runner;
        self
    }

    pub fn register_action(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.actions.insert(name.into(), handler);
        self
    }

    pub fn action(&self, name: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.actions.get(name)
    }
}
