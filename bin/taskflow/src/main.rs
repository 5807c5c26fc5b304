//! `taskflow`: validate and run workflow definitions from the command line.
//!
//! `run` executes a definition against in-memory collaborators: every task
//! completes as soon as it is activated (tasks named with `--fail-task`
//! fail), notifications are recorded, and progress is printed by polling the
//! execution monitor's log delta.

mod config;
mod error;

use crate::config::TaskflowConfig;
use crate::error::CliError;
use clap::{Parser, Subcommand};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use taskflow_core::{ExecutionId, TaskId};
use taskflow_scheduler::TriggerManager;
use taskflow_workflow::{
    AutoComplete, Engine, ExecutionLogEntry, ExecutionOrigin, ExecutionStatus, InMemoryTaskStore,
    InMemoryWorkflowStore, TriggerKind, WorkflowDefinition, WorkflowStatus, WorkflowStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Task-flow orchestration engine
#[derive(Parser)]
#[command(name = "taskflow")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (optional)
    #[arg(long, global = true, default_value = "taskflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a definition and print every violation
    Validate {
        /// Path to the definition file (JSON)
        definition: PathBuf,
    },

    /// Run a definition to completion
    Run {
        /// Path to the definition file (JSON)
        definition: PathBuf,

        /// Initial execution context (JSON)
        #[arg(long)]
        context: Option<String>,

        /// Task ids that report failure when activated
        #[arg(long = "fail-task")]
        fail_tasks: Vec<String>,

        /// Further definitions the workflow calls as subprocesses
        #[arg(long = "include")]
        includes: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Validate { definition } => validate(&definition).await,
        Commands::Run {
            definition,
            context,
            fail_tasks,
            includes,
        } => {
            let config = match TaskflowConfig::load(&cli.config) {
                Ok(config) => config,
                Err(error) => {
                    eprintln!(
                        "{}",
                        CliError::Config {
                            reason: error.to_string()
                        }
                    );
                    return ExitCode::FAILURE;
                }
            };
            tracing::info!(?config, "loaded configuration");
            run(config, &definition, context, fail_tasks, &includes).await
        }
    };

    match result {
        Ok(code) => code,
        Err(report) => {
            eprintln!("error: {report}");
            ExitCode::FAILURE
        }
    }
}

async fn load_definition(path: &Path) -> Result<WorkflowDefinition, Report<CliError>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|error| CliError::Read {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    let definition = serde_json::from_str(&text).map_err(|error| CliError::Parse {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;
    Ok(definition)
}

async fn validate(path: &Path) -> Result<ExitCode, Report<CliError>> {
    let definition = load_definition(path).await?;
    match definition.validate() {
        Ok(()) => {
            println!(
                "'{}' is valid: {} nodes, {} edges",
                definition.name,
                definition.nodes.len(),
                definition.edges.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(report) => {
            println!("'{}' is invalid:", definition.name);
            for violation in report.violations() {
                println!("  - {violation}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Stores a definition, activating drafts first.
async fn install(
    store: &InMemoryWorkflowStore,
    mut definition: WorkflowDefinition,
) -> Result<WorkflowDefinition, Report<CliError>> {
    let name = definition.name.clone();
    if definition.status != WorkflowStatus::Active {
        definition.activate().map_err(|error| CliError::Definition {
            name: name.clone(),
            reason: error.to_string(),
        })?;
    }
    let stored = store
        .create(definition)
        .await
        .map_err(|error| CliError::Definition {
            name,
            reason: error.to_string(),
        })?;
    Ok(stored)
}

fn runtime_error(error: impl std::fmt::Display) -> CliError {
    CliError::Runtime {
        reason: error.to_string(),
    }
}

async fn run(
    config: TaskflowConfig,
    path: &Path,
    context: Option<String>,
    fail_tasks: Vec<String>,
    includes: &[PathBuf],
) -> Result<ExitCode, Report<CliError>> {
    let context: JsonValue = match context {
        Some(text) => serde_json::from_str(&text).map_err(|error| CliError::Context {
            reason: error.to_string(),
        })?,
        None => JsonValue::Null,
    };

    let store = Arc::new(InMemoryWorkflowStore::new());
    for include in includes {
        let included = install(&store, load_definition(include).await?).await?;
        tracing::info!(workflow_id = %included.id, name = %included.name, "included definition");
    }
    let definition = install(&store, load_definition(path).await?).await?;

    let failing: HashSet<TaskId> = fail_tasks.into_iter().map(TaskId::from).collect();
    let tasks = Arc::new(InMemoryTaskStore::auto_completing(AutoComplete {
        failing,
        ..AutoComplete::default()
    }));
    let engine = Engine::builder(store)
        .task_store(tasks)
        .config(config.engine.clone())
        .build();

    let triggers = TriggerManager::new(Arc::new(engine.clone()), config.scheduler.clone());
    let synced = triggers
        .sync_workflow(&definition)
        .map_err(|report| runtime_error(report.current_context()))?;
    tracing::info!(added = synced.added, "triggers registered");

    let manual = triggers
        .list_for_workflow(definition.id)
        .into_iter()
        .find(|record| record.trigger.kind() == TriggerKind::Manual && record.is_enabled());
    let execution_id = match manual {
        Some(record) => triggers
            .fire_manual(record.id(), context)
            .await
            .map_err(|report| runtime_error(report.current_context()))?,
        None => engine
            .execute_with(definition.id, context, ExecutionOrigin::Manual)
            .await
            .map_err(|report| runtime_error(report.current_context()))?,
    };
    println!("started {execution_id} of '{}'", definition.name);

    let status = follow(&engine, execution_id, &config).await?;
    triggers.shutdown();
    Ok(if status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Prints log deltas until the execution is terminal.
async fn follow(
    engine: &Engine,
    execution_id: ExecutionId,
    config: &TaskflowConfig,
) -> Result<ExecutionStatus, Report<CliError>> {
    let mut interval = tokio::time::interval(config.poll_interval());
    let mut seen = 0;
    loop {
        interval.tick().await;
        // Read the status first so the final delta is never missed.
        let snapshot = engine
            .status(execution_id)
            .map_err(|report| runtime_error(report.current_context()))?;
        let delta = engine
            .log_delta(execution_id, seen)
            .map_err(|report| runtime_error(report.current_context()))?;
        for entry in &delta {
            print_entry(entry);
            seen = entry.seq;
        }

        if snapshot.is_terminal() {
            println!(
                "{execution_id} {} ({}%)",
                snapshot.status, snapshot.progress
            );
            if let Some(failure) = &snapshot.failure {
                println!("failure: {failure}");
            }
            println!("context: {}", snapshot.context);
            return Ok(snapshot.status);
        }
    }
}

fn print_entry(entry: &ExecutionLogEntry) {
    let node = entry
        .node_id
        .as_ref()
        .map(|node_id| format!(" [{node_id}]"))
        .unwrap_or_default();
    println!(
        "{:>4} {} {:<7}{node} {}",
        entry.seq,
        entry.timestamp.format("%H:%M:%S%.3f"),
        entry.level.to_string(),
        entry.message
    );
}
