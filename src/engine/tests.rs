use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use maplit::hashmap;
use serde_json::{json, Map, Value as JsonValue};

use crate::clients::{
    ActionHandler, Clients, DocumentIndex, LanguageModel, RetrievedDocument,
};
use crate::store::{MemoryRunStore, RunStore};
use crate::types::{RunState, RunStatus};
use crate::workflow::{
    AskAiConfig, CodeConfig, ExtractConfig, ExtractField, FieldKind, ForLoopConfig, FormConfig,
    FormQuestion, OutputConfig, QuestionKind, RetrieveConfig, Step, StepConfig, Workflow,
};

use super::{Engine, EngineError};

struct ScriptedModel {
    answer: String,
    extraction: JsonValue,
    fail: bool,
}

impl ScriptedModel {
    fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            extraction: json!({}),
            fail: false,
        }
    }

    fn extracting(extraction: JsonValue) -> Self {
        Self {
            answer: String::new(),
            extraction,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            answer: String::new(),
            extraction: json!({}),
            fail: true,
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        if self.fail {
            anyhow::bail!("model unavailable");
        }
        Ok(self.answer.clone())
    }

    async fn extract(
        &self,
        _description: &str,
        _text: &str,
        _fields: &[ExtractField],
        _multiple: bool,
    ) -> Result<JsonValue> {
        if self.fail {
            anyhow::bail!("model unavailable");
        }
        Ok(self.extraction.clone())
    }
}

struct ScriptedIndex {
    documents: Vec<RetrievedDocument>,
}

impl ScriptedIndex {
    fn with_one(id: i64) -> Self {
        Self {
            documents: vec![RetrievedDocument {
                id,
                contents: format!("contents of {id}"),
                title: format!("doc {id}"),
                url: String::new(),
            }],
        }
    }
}

#[async_trait]
impl DocumentIndex for ScriptedIndex {
    async fn search(&self, _query: &str) -> Result<Vec<RetrievedDocument>> {
        Ok(self.documents.clone())
    }
}

fn clients() -> Clients {
    Clients::new(
        Arc::new(ScriptedModel::answering("ok")),
        Arc::new(ScriptedIndex { documents: vec![] }),
    )
}

fn engine_with(store: Arc<MemoryRunStore>, clients: Clients) -> Engine {
    Engine::new(store, clients)
}

fn code(name: &str, snippet: &str) -> Step {
    Step::new(
        name,
        StepConfig::Code(CodeConfig {
            code: snippet.to_string(),
        }),
    )
}

fn for_loop(name: &str, array: &str, body: &str, variable: &str) -> Step {
    Step::new(
        name,
        StepConfig::ForLoop(ForLoopConfig {
            for_loop_array_expression: array.to_string(),
            for_loop_step_name: body.to_string(),
            for_loop_variable: variable.to_string(),
        }),
    )
}

fn context(entries: HashMap<&str, JsonValue>) -> Map<String, JsonValue> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[tokio::test]
async fn test_branching_scenario_terminates_at_low() {
    let workflow = Workflow::new(
        "branching",
        vec![
            code("calc", "return {sum: 1 + 2}").next_step("check"),
            code("check", "return {}").next_step("sum < 5 ? low : high"),
            Step::new("low", StepConfig::Stop),
            Step::new("high", StepConfig::Stop),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine.start(workflow, None, Map::new()).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("sum"), Some(&json!(3)));
    assert_eq!(state.error, None);
}

#[tokio::test]
async fn test_fallthrough_past_last_step_completes() {
    let workflow = Workflow::new(
        "linear",
        vec![
            code("first", "return {a: 1}"),
            code("second", "return {b: a + 1}"),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine.start(workflow, None, Map::new()).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("b"), Some(&json!(2)));
    assert_eq!(state.current_step, None);
}

#[tokio::test]
async fn test_code_merge_overwrites_only_returned_keys() {
    let workflow = Workflow::new("merge", vec![code("update", "return {b: 9, c: 3}")]);

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine
        .start(
            workflow,
            None,
            context(hashmap! { "a" => json!(1), "b" => json!(2) }),
        )
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("a"), Some(&json!(1)));
    assert_eq!(state.context.get("b"), Some(&json!(9)));
    assert_eq!(state.context.get("c"), Some(&json!(3)));
}

#[tokio::test]
async fn test_for_loop_over_empty_array_skips_body() {
    let workflow = Workflow::new(
        "empty_loop",
        vec![
            for_loop("each", "items", "body", "item").next_step("after"),
            code("body", "return {ran_body: true}"),
            Step::new("end", StepConfig::EndForLoop),
            code("after", "return {done: true}"),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine
        .start(workflow, None, context(hashmap! { "items" => json!([]) }))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("ran_body"), None);
    assert_eq!(state.context.get("done"), Some(&json!(true)));
}

#[tokio::test]
async fn test_for_loop_iterates_in_order() {
    let workflow = Workflow::new(
        "loop3",
        vec![
            for_loop("each", "items", "body", "item").next_step("after"),
            code("body", "return {seen: seen + ',' + item}"),
            Step::new("end", StepConfig::EndForLoop),
            code("after", "return {done: true}"),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine
        .start(
            workflow,
            None,
            context(hashmap! {
                "items" => json!(["a", "b", "c"]),
                "seen" => json!(""),
            }),
        )
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("seen"), Some(&json!(",a,b,c")));
    assert_eq!(state.context.get("done"), Some(&json!(true)));
    assert!(state.loop_stack.is_empty());
}

#[tokio::test]
async fn test_nested_loops_close_innermost_first() {
    let workflow = Workflow::new(
        "nested",
        vec![
            for_loop("outer", "xs", "inner", "x"),
            for_loop("inner", "ys", "body", "y").next_step("outer_end"),
            code("body", "return {log: log + x + '-' + y + ';'}"),
            Step::new("inner_end", StepConfig::EndForLoop),
            Step::new("outer_end", StepConfig::EndForLoop),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine
        .start(
            workflow,
            None,
            context(hashmap! {
                "xs" => json!([1, 2]),
                "ys" => json!([10, 20]),
                "log" => json!(""),
            }),
        )
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(
        state.context.get("log"),
        Some(&json!("1-10;1-20;2-10;2-20;"))
    );
    assert!(state.loop_stack.is_empty());
}

#[tokio::test]
async fn test_loop_variable_shadowing_is_restored() {
    let workflow = Workflow::new(
        "shadow",
        vec![
            for_loop("each", "items", "body", "item"),
            code("body", "return {}"),
            Step::new("end", StepConfig::EndForLoop),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine
        .start(
            workflow,
            None,
            context(hashmap! {
                "items" => json!([1, 2]),
                "item" => json!("original"),
            }),
        )
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("item"), Some(&json!("original")));
}

#[tokio::test]
async fn test_unmatched_end_for_loop_is_rejected_before_running() {
    let workflow = Workflow::new(
        "bad",
        vec![
            code("first", "return {ran: true}"),
            Step::new("end", StepConfig::EndForLoop),
        ],
    );

    let store = Arc::new(MemoryRunStore::new());
    let engine = engine_with(store.clone(), clients());
    let err = engine
        .start(workflow, Some("r1".to_string()), Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)));
    // The run was never created
    assert!(store.load("r1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_retrieve_appends_instead_of_replacing() {
    let workflow = Workflow::new(
        "retrieval",
        vec![
            Step::new(
                "search_once",
                StepConfig::Retrieve(RetrieveConfig {
                    retrieve_term_expression: "'widgets'".to_string(),
                    retrieve_to_variable: "docs".to_string(),
                }),
            ),
            Step::new(
                "search_again",
                StepConfig::Retrieve(RetrieveConfig {
                    retrieve_term_expression: "'widgets'".to_string(),
                    retrieve_to_variable: "docs".to_string(),
                }),
            ),
        ],
    );

    let clients = Clients::new(
        Arc::new(ScriptedModel::answering("ok")),
        Arc::new(ScriptedIndex::with_one(7)),
    );
    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients);
    let state = engine.start(workflow, None, Map::new()).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    let docs = state.context.get("docs").unwrap().as_array().unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["id"], 7);
    assert_eq!(docs[0]["title"], "doc 7");
    // An absent url serializes as an empty string, never null
    assert_eq!(docs[0]["url"], "");
    assert_eq!(docs[1]["contents"], "contents of 7");
}

#[tokio::test]
async fn test_form_suspends_and_resumes_with_answers() {
    let workflow = Workflow::new(
        "survey",
        vec![
            Step::new(
                "ask_user",
                StepConfig::Form(FormConfig {
                    form_title: None,
                    form_questions: vec![
                        FormQuestion {
                            question_title: "Proceed?".to_string(),
                            question_type: QuestionKind::YesNo,
                            variable_name: "proceed".to_string(),
                            multiple_choice_answer: vec![],
                        },
                        FormQuestion {
                            question_title: "How many?".to_string(),
                            question_type: QuestionKind::Integer,
                            variable_name: "count".to_string(),
                            multiple_choice_answer: vec![],
                        },
                    ],
                }),
            ),
            code("after", "return {total: count * 2}"),
        ],
    );

    let store = Arc::new(MemoryRunStore::new());
    let engine = engine_with(store.clone(), clients());
    let state = engine
        .start(workflow, Some("r1".to_string()), Map::new())
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Suspended);
    assert_eq!(state.current_step.as_deref(), Some("ask_user"));

    // The suspended state is durable
    let stored = store.load("r1").await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Suspended);

    let answers = context(hashmap! {
        "proceed" => json!(true),
        "count" => json!(4),
        "not_declared" => json!("dropped"),
    });
    let state = engine.resume("r1", answers).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("proceed"), Some(&json!(true)));
    assert_eq!(state.context.get("total"), Some(&json!(8)));
    // Answers for undeclared variables are not merged
    assert_eq!(state.context.get("not_declared"), None);
}

#[tokio::test]
async fn test_resume_of_non_suspended_run_is_refused() {
    let workflow = Workflow::new("done", vec![Step::new("stop", StepConfig::Stop)]);

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine
        .start(workflow, Some("r1".to_string()), Map::new())
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);

    let err = engine.resume("r1", Map::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotSuspended { .. }));
    let err = engine.resume("missing", Map::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownRun(_)));
}

#[tokio::test]
async fn test_only_if_false_skips_body_but_continues() {
    let workflow = Workflow::new(
        "guarded",
        vec![
            code("skipped", "return {ran: true}").only_if("enabled"),
            code("after", "return {done: true}"),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine
        .start(workflow, None, context(hashmap! { "enabled" => json!(false) }))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("ran"), None);
    assert_eq!(state.context.get("done"), Some(&json!(true)));
}

#[tokio::test]
async fn test_ask_ai_writes_answer_variable() {
    let workflow = Workflow::new(
        "qa",
        vec![Step::new(
            "ask",
            StepConfig::AskAi(AskAiConfig {
                ask_question_expression: "'Summarize ' + topic".to_string(),
                answer_variable: "summary".to_string(),
            }),
        )],
    );

    let clients = Clients::new(
        Arc::new(ScriptedModel::answering("a short summary")),
        Arc::new(ScriptedIndex { documents: vec![] }),
    );
    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients);
    let state = engine
        .start(workflow, None, context(hashmap! { "topic" => json!("widgets") }))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("summary"), Some(&json!("a short summary")));
}

#[tokio::test]
async fn test_extract_writes_structured_result() {
    let workflow = Workflow::new(
        "extraction",
        vec![Step::new(
            "pull_fields",
            StepConfig::Extract(ExtractConfig {
                extract_from_string_expression: "raw_text".to_string(),
                extract_description: "invoice data".to_string(),
                extract_fields: vec![ExtractField {
                    name: "amount".to_string(),
                    description: None,
                    field_type: FieldKind::Number,
                }],
                extract_multiple: false,
                extract_to_variable: "invoice".to_string(),
            }),
        )],
    );

    let clients = Clients::new(
        Arc::new(ScriptedModel::extracting(json!({"amount": 12.5}))),
        Arc::new(ScriptedIndex { documents: vec![] }),
    );
    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients);
    let state = engine
        .start(
            workflow,
            None,
            context(hashmap! { "raw_text" => json!("total due: 12.50") }),
        )
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.get("invoice"), Some(&json!({"amount": 12.5})));
}

#[tokio::test]
async fn test_collaborator_failure_fails_the_run() {
    let workflow = Workflow::new(
        "qa",
        vec![
            code("prepare", "return {topic: 'widgets'}"),
            Step::new(
                "ask",
                StepConfig::AskAi(AskAiConfig {
                    ask_question_expression: "topic".to_string(),
                    answer_variable: "summary".to_string(),
                }),
            ),
            code("never", "return {past_failure: true}"),
        ],
    );

    let clients = Clients::new(
        Arc::new(ScriptedModel::failing()),
        Arc::new(ScriptedIndex { documents: vec![] }),
    );
    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients);
    let state = engine.start(workflow, None, Map::new()).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    let error = state.error.unwrap();
    assert_eq!(error.step, "ask");
    assert!(error.message.contains("model unavailable"));
    // Context up to the failed step is preserved, nothing after ran
    assert_eq!(state.context.get("topic"), Some(&json!("widgets")));
    assert_eq!(state.context.get("past_failure"), None);
}

#[tokio::test]
async fn test_resolution_error_fails_the_run_and_keeps_context() {
    let workflow = Workflow::new(
        "bad_branch",
        vec![
            code("calc", "return {sum: 3}").next_step("'nowhere'"),
            Step::new("stop", StepConfig::Stop),
        ],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine.start(workflow, None, Map::new()).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    let error = state.error.unwrap();
    assert_eq!(error.step, "calc");
    assert!(error.message.contains("nowhere"));
    assert_eq!(state.context.get("sum"), Some(&json!(3)));
}

#[tokio::test]
async fn test_output_renders_without_mutating_context() {
    let workflow = Workflow::new(
        "report",
        vec![Step::new(
            "show",
            StepConfig::Output(OutputConfig {
                html: Some("<p>Hello {{ name }}</p>".to_string()),
                table_expression: Some("rows".to_string()),
            }),
        )],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let initial = context(hashmap! {
        "name" => json!("ada"),
        "rows" => json!([{"id": 1, "label": "x"}]),
    });
    let state = engine.start(workflow, None, initial.clone()).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context, initial);
    assert_eq!(state.outputs.len(), 1);
    assert_eq!(state.outputs[0].step, "show");
    assert!(state.outputs[0].html.contains("<p>Hello ada</p>"));
    assert!(state.outputs[0].html.contains("<th>id</th>"));
    assert!(state.outputs[0].html.contains("<td>x</td>"));
}

struct CancelOwnRun {
    store: Arc<MemoryRunStore>,
    run_id: String,
}

#[async_trait]
impl ActionHandler for CancelOwnRun {
    async fn run(
        &self,
        _configuration: &JsonValue,
        _context: &Map<String, JsonValue>,
    ) -> Result<Option<Map<String, JsonValue>>> {
        self.store.mark_cancelled(&self.run_id).await?;
        Ok(None)
    }
}

#[tokio::test]
async fn test_cancellation_stops_before_the_next_step() {
    let workflow = Workflow::new(
        "cancellable",
        vec![
            Step::new(
                "trip",
                StepConfig::Custom {
                    action: "trip_cancel".to_string(),
                    configuration: json!({}),
                },
            ),
            code("never", "return {past_cancel: true}"),
        ],
    );

    let store = Arc::new(MemoryRunStore::new());
    let clients = clients().register_action(
        "trip_cancel",
        Arc::new(CancelOwnRun {
            store: store.clone(),
            run_id: "r1".to_string(),
        }),
    );
    let engine = engine_with(store.clone(), clients);
    let state = engine
        .start(workflow, Some("r1".to_string()), Map::new())
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.context.get("past_cancel"), None);
}

/// Reads the stored run while its own step executes
struct ObserveStoredContext {
    store: Arc<MemoryRunStore>,
    run_id: String,
}

#[async_trait]
impl ActionHandler for ObserveStoredContext {
    async fn run(
        &self,
        _configuration: &JsonValue,
        _context: &Map<String, JsonValue>,
    ) -> Result<Option<Map<String, JsonValue>>> {
        let stored = self
            .store
            .load(&self.run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run not in store"))?;
        let mut updates = Map::new();
        updates.insert(
            "stored_written".to_string(),
            stored
                .context
                .get("written")
                .cloned()
                .unwrap_or(JsonValue::Null),
        );
        Ok(Some(updates))
    }
}

#[tokio::test]
async fn test_context_writes_are_durable_before_the_next_step() {
    let workflow = Workflow::new(
        "durable",
        vec![
            code("write", "return {written: 42}"),
            Step::new(
                "observe",
                StepConfig::Custom {
                    action: "observe_store".to_string(),
                    configuration: json!({}),
                },
            ),
        ],
    );

    let store = Arc::new(MemoryRunStore::new());
    let clients = clients().register_action(
        "observe_store",
        Arc::new(ObserveStoredContext {
            store: store.clone(),
            run_id: "r1".to_string(),
        }),
    );
    let engine = engine_with(store.clone(), clients);
    let state = engine
        .start(workflow, Some("r1".to_string()), Map::new())
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    // The first step's write had already been saved when the second ran,
    // so a crash between the two would have lost nothing from step one
    assert_eq!(state.context.get("stored_written"), Some(&json!(42)));
}

#[tokio::test]
async fn test_resume_reports_corrupt_stored_state() {
    let workflow = Workflow::new("w", vec![Step::new("only", StepConfig::Stop)]);
    let store = Arc::new(MemoryRunStore::new());

    let mut no_step = RunState::new("r1", workflow.clone(), "only");
    no_step.status = RunStatus::Suspended;
    no_step.current_step = None;
    store.create(&no_step).await.unwrap();

    let mut ghost_step = RunState::new("r2", workflow, "only");
    ghost_step.status = RunStatus::Suspended;
    ghost_step.current_step = Some("ghost".to_string());
    store.create(&ghost_step).await.unwrap();

    let engine = engine_with(store, clients());
    let err = engine.resume("r1", Map::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::CorruptRun { .. }));
    let err = engine.resume("r2", Map::new()).await.unwrap_err();
    assert!(err.to_string().contains("unknown step 'ghost'"));
}

#[tokio::test]
async fn test_unregistered_custom_action_fails_the_run() {
    let workflow = Workflow::new(
        "custom",
        vec![Step::new(
            "notify",
            StepConfig::Custom {
                action: "send_email".to_string(),
                configuration: json!({"to": "ops@example.com"}),
            },
        )],
    );

    let engine = engine_with(Arc::new(MemoryRunStore::new()), clients());
    let state = engine.start(workflow, None, Map::new()).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state
        .error
        .unwrap()
        .message
        .contains("no handler registered for action 'send_email'"));
}
