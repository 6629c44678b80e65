//! Administrative CLI
//!
//! Thin front-end over the library: validate and diagram workflow JSON
//! files, run them against the Postgres store, and inspect, resume or
//! cancel existing runs. AskAI/Extract/Retrieve steps need real
//! collaborators wired in by an embedding host; from the CLI those steps
//! fail their run with a clear message.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as JsonValue};

use crate::clients::{Clients, DocumentIndex, LanguageModel, RetrievedDocument};
use crate::config::Config;
use crate::db;
use crate::engine::Engine;
use crate::store::{PostgresRunStore, RunStore};
use crate::types::RunState;
use crate::workflow::{diagram, ExtractField, ValidatedWorkflow, Workflow};

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "Workflow step interpreter CLI", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// Validate a workflow definition file
    Validate {
        /// Path to a workflow JSON file
        file: PathBuf,
    },

    /// Print a Mermaid diagram of a workflow definition
    Diagram {
        /// Path to a workflow JSON file
        file: PathBuf,
    },

    /// Start a new run of a workflow
    Run {
        /// Path to a workflow JSON file
        file: PathBuf,

        /// Initial context as a JSON object
        #[arg(long)]
        context: Option<String>,

        /// Run id (defaults to a fresh UUID)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show the state of a run
    Status {
        /// Run id to query
        run_id: String,
    },

    /// Resume a suspended run with form answers
    Resume {
        /// Run id to resume
        run_id: String,

        /// Answers as a JSON object keyed by variable name
        #[arg(long)]
        answers: Option<String>,
    },

    /// Cancel a run
    Cancel {
        /// Run id to cancel
        run_id: String,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::builder()
        .database_url(cli.database_url.clone())
        .config_path(cli.config.clone().map(PathBuf::from))
        .build()?;

    match cli.command {
        Commands::Migrate => {
            println!("Running migrations...");
            let pool = db::get_pool(&config.database).await?;
            db::migrate(&pool).await?;
            println!("Migrations complete!");
        }

        Commands::Validate { file } => {
            let workflow = load_workflow(&file)?;
            let validated = ValidatedWorkflow::validate(workflow)?;
            println!(
                "'{}' is valid: {} steps, initial step '{}', version {}",
                validated.name(),
                validated.steps().len(),
                validated.initial_step().name,
                &validated.version_hash()[..12],
            );
        }

        Commands::Diagram { file } => {
            let workflow = load_workflow(&file)?;
            let validated = ValidatedWorkflow::validate(workflow)?;
            print!("{}", diagram::render(&validated));
        }

        Commands::Run { file, context, id } => {
            let workflow = load_workflow(&file)?;
            let initial_context = match context {
                Some(raw) => parse_object(&raw).context("Invalid --context")?,
                None => Map::new(),
            };
            let engine = engine(&config).await?;
            let state = engine.start(workflow, id, initial_context).await?;
            print_state(&state);
        }

        Commands::Status { run_id } => {
            let store = store(&config).await?;
            let state = store
                .load(&run_id)
                .await?
                .ok_or_else(|| anyhow!("No run with id '{run_id}'"))?;
            print_state(&state);
        }

        Commands::Resume { run_id, answers } => {
            let answers = match answers {
                Some(raw) => parse_object(&raw).context("Invalid --answers")?,
                None => Map::new(),
            };
            let engine = engine(&config).await?;
            let state = engine.resume(&run_id, answers).await?;
            print_state(&state);
        }

        Commands::Cancel { run_id, yes } => {
            if !yes {
                println!("Cancel run '{run_id}'? [y/N]");
                let mut line = String::new();
                std::io::stdin()
                    .read_line(&mut line)
                    .context("Failed to read confirmation")?;
                if !matches!(line.trim(), "y" | "Y" | "yes") {
                    println!("Aborted.");
                    return Ok(());
                }
            }
            let store = store(&config).await?;
            if store.mark_cancelled(&run_id).await? {
                println!("Run '{run_id}' cancelled.");
            } else {
                println!("Run '{run_id}' not found or already finished.");
            }
        }
    }

    Ok(())
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&source)
        .with_context(|| format!("Failed to parse workflow from {}", path.display()))
}

fn parse_object(raw: &str) -> Result<Map<String, JsonValue>> {
    match serde_json::from_str(raw)? {
        JsonValue::Object(map) => Ok(map),
        _ => Err(anyhow!("expected a JSON object")),
    }
}

async fn store(config: &Config) -> Result<Arc<PostgresRunStore>> {
    let pool = db::get_pool(&config.database).await?;
    Ok(Arc::new(PostgresRunStore::new(pool)))
}

async fn engine(config: &Config) -> Result<Engine> {
    let store = store(config).await?;
    let clients = Clients::new(Arc::new(Unconfigured), Arc::new(Unconfigured));
    Ok(Engine::new(store, clients))
}

fn print_state(state: &RunState) {
    println!("run:      {}", state.run_id);
    println!("workflow: {}", state.workflow.name);
    println!("status:   {:?}", state.status);
    if let Some(step) = &state.current_step {
        println!("step:     {step}");
    }
    if let Some(error) = &state.error {
        println!("error:    [{}] {}", error.step, error.message);
    }
    println!(
        "context:  {}",
        serde_json::to_string_pretty(&state.context).unwrap_or_default()
    );
    for output in &state.outputs {
        println!("output [{}]:\n{}", output.step, output.html);
    }
}

/// Placeholder collaborators for CLI-only runs
struct Unconfigured;

#[async_trait]
impl LanguageModel for Unconfigured {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!("no language model configured"))
    }

    async fn extract(
        &self,
        _description: &str,
        _text: &str,
        _fields: &[ExtractField],
        _multiple: bool,
    ) -> Result<JsonValue> {
        Err(anyhow!("no language model configured"))
    }
}

#[async_trait]
impl DocumentIndex for Unconfigured {
    async fn search(&self, _query: &str) -> Result<Vec<RetrievedDocument>> {
        Err(anyhow!("no document index configured"))
    }
}
