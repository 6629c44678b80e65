//! Workflow step interpreter
//!
//! Executes directed graphs of typed steps (Code, Form, Output, AskAI,
//! Extract, Retrieve, ForLoop/EndForLoop, Stop) against a persisted,
//! mutable context, one step at a time. Runs suspend at Form steps pending
//! user input and resume later from durable storage; next-step routing is
//! by literal name or by an expression evaluated against the context.
//!
//! The engine only talks to collaborators through traits: a language
//! model, a document index, a code runner and a run store. Embed it by
//! implementing those and handing a [`clients::Clients`] bundle to
//! [`engine::Engine`].

pub mod cli;
pub mod clients;
pub mod config;
pub mod db;
pub mod engine;
pub mod expr;
pub mod store;
pub mod types;
pub mod workflow;

// Re-export main types
pub use types::*;

pub use clients::Clients;
pub use engine::{Engine, EngineError};
pub use store::{MemoryRunStore, PostgresRunStore, RunStore};
pub use workflow::{DefinitionError, Step, StepConfig, ValidatedWorkflow, Workflow};
