//! Command-line interface for the chain engine.
//!
//! Provides commands for authoring definitions, firing trigger events
//! locally, inspecting executions and resuming interrupted ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::adapters::register_builtin;
use crate::catalog::{ActionRegistry, TriggerRegistry};
use crate::config;
use crate::core::{ChainService, Engine, Journal, StepExecutor};
use crate::domain::{
    ChainDefinition, ChainDefinitionId, ChainExecution, ChainExecutionId, CorrelationId,
    EventType, ExecutionStatus, FamilyId, NewChainDefinition, TriggerEvent, UserId,
};
use crate::store::{ChainStore, ExecutionFilter, MemoryStore, SqliteStore};

/// chains - Event chain orchestrator for family automations
#[derive(Parser, Debug)]
#[command(name = "chains")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a chain definition file against the catalogs
    Validate {
        /// Definition YAML file
        file: PathBuf,
    },

    /// Import a chain definition file into a family
    Import {
        /// Definition YAML file
        file: PathBuf,

        #[arg(short, long)]
        family: FamilyId,

        /// Authoring user
        #[arg(short, long)]
        user: UserId,
    },

    /// List a family's chain definitions
    Definitions {
        #[arg(short, long)]
        family: FamilyId,

        /// Only show enabled (true) or disabled (false) definitions
        #[arg(long)]
        enabled: Option<bool>,
    },

    /// Show one chain definition and its steps
    Definition {
        /// Definition ID (UUID)
        id: ChainDefinitionId,

        #[arg(short, long)]
        family: FamilyId,
    },

    /// Enable a chain definition (re-validates it)
    Enable {
        id: ChainDefinitionId,

        #[arg(short, long)]
        family: FamilyId,
    },

    /// Disable a chain definition
    Disable {
        id: ChainDefinitionId,

        #[arg(short, long)]
        family: FamilyId,
    },

    /// Clone a marketplace template into a family
    Instantiate {
        /// Template name
        template: String,

        #[arg(short, long)]
        family: FamilyId,

        #[arg(short, long)]
        user: UserId,
    },

    /// Fire a trigger event and wait for the chains it starts
    Fire {
        #[arg(short, long)]
        family: FamilyId,

        #[arg(short, long)]
        event_type: String,

        #[arg(short, long)]
        module: String,

        /// Trigger payload as JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Reuse a correlation id (simulates redelivery)
        #[arg(long)]
        correlation_id: Option<CorrelationId>,
    },

    /// List a family's executions
    Executions {
        #[arg(short, long)]
        family: FamilyId,

        /// Only executions of this definition
        #[arg(short, long)]
        definition: Option<ChainDefinitionId>,

        /// Only executions in this status (e.g. running, failed)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show the status of an execution
    Status {
        /// Execution ID (UUID)
        execution_id: ChainExecutionId,

        #[arg(short, long)]
        family: FamilyId,
    },

    /// Resume an interrupted execution
    Resume {
        execution_id: ChainExecutionId,

        #[arg(short, long)]
        family: FamilyId,
    },

    /// Show which of a family's executions created or touched an entity
    Mappings {
        entity_id: String,

        #[arg(short, long)]
        family: FamilyId,

        #[arg(short = 't', long)]
        entity_type: Option<String>,
    },

    /// Show the journal of an execution, or list journaled executions
    Journal {
        execution_id: Option<ChainExecutionId>,

        /// Only events of this type (e.g. step_failed)
        #[arg(short, long, value_parser = parse_event_type)]
        event_type: Option<EventType>,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Validate { file } => validate_file(&file).await,
            Commands::Import { file, family, user } => import_definition(&file, family, user).await,
            Commands::Definitions { family, enabled } => list_definitions(family, enabled).await,
            Commands::Definition { id, family } => show_definition(family, id).await,
            Commands::Enable { id, family } => set_enabled(family, id, true).await,
            Commands::Disable { id, family } => set_enabled(family, id, false).await,
            Commands::Instantiate {
                template,
                family,
                user,
            } => instantiate_template(&template, family, user).await,
            Commands::Fire {
                family,
                event_type,
                module,
                payload,
                correlation_id,
            } => fire_trigger(family, event_type, module, &payload, correlation_id).await,
            Commands::Executions {
                family,
                definition,
                status,
            } => list_executions(family, definition, status).await,
            Commands::Status {
                execution_id,
                family,
            } => show_status(family, execution_id).await,
            Commands::Resume {
                execution_id,
                family,
            } => resume_execution(family, execution_id).await,
            Commands::Mappings {
                entity_id,
                family,
                entity_type,
            } => show_mappings(family, &entity_id, entity_type.as_deref()).await,
            Commands::Journal {
                execution_id: Some(execution_id),
                event_type,
            } => show_journal(execution_id, event_type).await,
            Commands::Journal {
                execution_id: None, ..
            } => list_journals().await,
            Commands::Config => show_config(),
        }
    }
}

/// Store, catalogs, service and engine wired from the resolved config
struct Runtime {
    service: ChainService,
    engine: Engine,
}

fn action_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_builtin(&mut registry);
    registry
}

fn trigger_registry() -> Result<TriggerRegistry> {
    let cfg = config::config()?;
    match &cfg.triggers {
        Some(path) => TriggerRegistry::from_file(path),
        None => Ok(TriggerRegistry::new()),
    }
}

fn runtime() -> Result<Runtime> {
    let cfg = config::config()?;

    let store: Arc<dyn ChainStore> = Arc::new(
        SqliteStore::open(&cfg.database)
            .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?,
    );
    let actions = Arc::new(action_registry());
    let triggers = Arc::new(trigger_registry()?);

    let executor = StepExecutor::new(Arc::clone(&store), actions.clone())
        .with_retry_policy(cfg.retry.clone())
        .with_limits(cfg.limits.clone())
        .with_observer(Arc::new(Journal::from_config()?));

    let service =
        ChainService::new(store, actions, triggers).with_limits(cfg.limits.clone());

    Ok(Runtime {
        service,
        engine: Engine::new(executor),
    })
}

/// Validate a definition file without touching the database
async fn validate_file(file: &Path) -> Result<()> {
    let cfg = config::config()?;
    let new = NewChainDefinition::from_file(file)?;
    let definition = new.into_definition(FamilyId::new(), UserId::new());

    let service = ChainService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(action_registry()),
        Arc::new(trigger_registry()?),
    )
    .with_limits(cfg.limits.clone());

    service.validate(&definition)?;
    println!(
        "✓ '{}' is valid ({} steps, trigger {}/{})",
        definition.name,
        definition.steps.len(),
        definition.trigger_module,
        definition.trigger_event_type
    );
    Ok(())
}

async fn import_definition(file: &Path, family: FamilyId, user: UserId) -> Result<()> {
    let runtime = runtime()?;
    let new = NewChainDefinition::from_file(file)?;
    let definition = runtime.service.create_definition(family, user, new).await?;

    println!("Imported '{}'", definition.name);
    println!("Definition ID: {}", definition.id);
    Ok(())
}

async fn list_definitions(family: FamilyId, enabled: Option<bool>) -> Result<()> {
    let runtime = runtime()?;
    let definitions = runtime.service.list_definitions(family, enabled).await?;

    if definitions.is_empty() {
        println!("No chain definitions found");
        return Ok(());
    }

    println!(
        "{:<38} {:<28} {:<30} {:<8} {:<4}",
        "DEFINITION ID", "NAME", "TRIGGER", "ENABLED", "VER"
    );
    println!("{}", "-".repeat(112));

    for def in definitions {
        let trigger = format!("{}/{}", def.trigger_module, def.trigger_event_type);
        println!(
            "{:<38} {:<28} {:<30} {:<8} {:<4}",
            def.id,
            truncate(&def.name, 27),
            truncate(&trigger, 29),
            if def.is_enabled { "yes" } else { "no" },
            def.version
        );
    }

    Ok(())
}

async fn show_definition(family: FamilyId, id: ChainDefinitionId) -> Result<()> {
    let runtime = runtime()?;
    let def = runtime.service.get_definition(family, id).await?;
    let runs = runtime.service.count_executions(family, id).await?;
    print_definition(&def, runs);
    Ok(())
}

fn print_definition(def: &ChainDefinition, runs: u64) {
    println!("Definition ID: {}", def.id);
    println!("Name: {}", def.name);
    if let Some(description) = &def.description {
        println!("Description: {}", description);
    }
    println!(
        "Trigger: {}/{}",
        def.trigger_module, def.trigger_event_type
    );
    println!("Enabled: {}", def.is_enabled);
    if let Some(template) = &def.template_name {
        println!("Template: {}", template);
    }
    println!("Version: {}", def.version);
    println!("Executions: {}", runs);
    println!("\nSteps:");
    for (position, step) in def.ordered_steps().into_iter().enumerate() {
        let compensation = match (step.is_compensatable, &step.compensation_action_type) {
            (true, Some(action)) => format!(" (compensate: {})", action),
            _ => String::new(),
        };
        let guard = if step.condition_expression.is_some() {
            " [guarded]"
        } else {
            ""
        };
        println!(
            "  {}. {} -> {}/{} v{}{}{}",
            position + 1,
            step.alias,
            step.module,
            step.action_type,
            step.action_version,
            guard,
            compensation
        );
    }
}

async fn set_enabled(family: FamilyId, id: ChainDefinitionId, enabled: bool) -> Result<()> {
    let runtime = runtime()?;
    let def = runtime.service.set_enabled(family, id, enabled).await?;
    println!(
        "'{}' is now {} (version {})",
        def.name,
        if def.is_enabled { "enabled" } else { "disabled" },
        def.version
    );
    Ok(())
}

async fn instantiate_template(template: &str, family: FamilyId, user: UserId) -> Result<()> {
    let runtime = runtime()?;
    let def = runtime
        .service
        .instantiate_template(template, family, user)
        .await?;
    println!("Instantiated template '{}'", template);
    println!("Definition ID: {}", def.id);
    Ok(())
}

async fn fire_trigger(
    family: FamilyId,
    event_type: String,
    module: String,
    payload: &str,
    correlation_id: Option<CorrelationId>,
) -> Result<()> {
    let payload: Value =
        serde_json::from_str(payload).context("Trigger payload must be valid JSON")?;

    let mut event = TriggerEvent::new(event_type, module, payload, family);
    if let Some(correlation_id) = correlation_id {
        event = event.with_correlation_id(correlation_id);
    }
    let correlation_id = event.correlation_id;

    let runtime = runtime()?;
    let executions = runtime.engine.dispatch_and_wait(event).await?;

    eprintln!("Correlation ID: {}", correlation_id);
    if executions.is_empty() {
        println!("No chain executions started");
        return Ok(());
    }

    print_execution_table(&executions);
    Ok(())
}

async fn list_executions(
    family: FamilyId,
    definition: Option<ChainDefinitionId>,
    status: Option<String>,
) -> Result<()> {
    let status = status
        .map(|s| s.parse::<ExecutionStatus>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let filter = ExecutionFilter {
        definition_id: definition,
        status,
    };

    let runtime = runtime()?;
    let executions = runtime.service.list_executions(family, &filter).await?;

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    print_execution_table(&executions);
    Ok(())
}

fn print_execution_table(executions: &[ChainExecution]) {
    println!(
        "{:<38} {:<38} {:<20} {:<10}",
        "EXECUTION ID", "DEFINITION ID", "STATUS", "STEPS"
    );
    println!("{}", "-".repeat(108));

    for execution in executions {
        println!(
            "{:<38} {:<38} {:<20} {:<10}",
            execution.id,
            execution.chain_definition_id,
            execution.status,
            execution.step_executions.len()
        );
    }
}

async fn show_status(family: FamilyId, id: ChainExecutionId) -> Result<()> {
    let runtime = runtime()?;
    let execution = runtime.service.get_execution(family, id).await?;
    print_execution(&execution);
    Ok(())
}

fn print_execution(execution: &ChainExecution) {
    println!("Execution ID: {}", execution.id);
    println!("Definition: {}", execution.chain_definition_id);
    println!("Correlation: {}", execution.correlation_id);
    println!("Trigger: {}", execution.trigger_event_type);
    println!("Status: {}", execution.status);
    println!("Started: {}", execution.started_at);
    if let Some(completed) = execution.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(failed) = execution.failed_at {
        println!("Failed: {}", failed);
    }
    if let Some(alias) = &execution.failed_step_alias {
        println!("Failed step: {}", alias);
    }
    if let Some(error) = &execution.error_message {
        println!("Error: {}", error);
    }

    println!("\nSteps:");
    let mut steps: Vec<_> = execution.step_executions.iter().collect();
    steps.sort_by_key(|s| s.position);
    for step in steps {
        let retries = if step.retry_count > 0 {
            format!(" (retries: {})", step.retry_count)
        } else {
            String::new()
        };
        println!("  {}: {}{}", step.step_alias, step.status, retries);
        if let Some(error) = &step.error_message {
            println!("      {}", error);
        }
    }
}

async fn resume_execution(family: FamilyId, id: ChainExecutionId) -> Result<()> {
    let runtime = runtime()?;
    let execution = runtime.engine.resume(family, id).await?;

    eprintln!("Execution finished: {}", execution.status);
    print_execution(&execution);
    Ok(())
}

async fn show_mappings(
    family: FamilyId,
    entity_id: &str,
    entity_type: Option<&str>,
) -> Result<()> {
    let runtime = runtime()?;
    let mappings = runtime
        .service
        .mappings_for_entity(family, entity_id, entity_type)
        .await?;

    if mappings.is_empty() {
        println!("No chain touched entity '{}'", entity_id);
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<16} {:<12} {:<20}",
        "EXECUTION ID", "STEP", "ENTITY TYPE", "MODULE", "RECORDED"
    );
    println!("{}", "-".repeat(108));

    for mapping in mappings {
        println!(
            "{:<38} {:<20} {:<16} {:<12} {:<20}",
            mapping.chain_execution_id,
            truncate(&mapping.step_alias, 19),
            truncate(&mapping.entity_type, 15),
            truncate(&mapping.module, 11),
            mapping.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn show_journal(id: ChainExecutionId, event_type: Option<EventType>) -> Result<()> {
    let journal = Journal::from_config()?;
    let events = match event_type {
        Some(event_type) => journal.events_of_type(id, event_type).await?,
        None => journal.replay(id).await?,
    };

    if events.is_empty() {
        println!("No journal entries for {}", id);
        return Ok(());
    }

    for event in events {
        let step = event.step_alias.as_deref().unwrap_or("-");
        let duration = event
            .duration_ms
            .map(|ms| format!(" ({}ms)", ms))
            .unwrap_or_default();
        println!(
            "{} {:<22} {:<16} {}{}",
            event.timestamp.format("%H:%M:%S%.3f"),
            format!("{:?}", event.event_type),
            step,
            event.summary,
            duration
        );
        if let Some(error) = &event.error {
            println!("    error: {}", error);
        }
    }

    Ok(())
}

async fn list_journals() -> Result<()> {
    let journal = Journal::from_config()?;
    let mut ids = journal.list_executions().await?;
    if ids.is_empty() {
        println!("No journals in {}", journal.base_dir().display());
        return Ok(());
    }

    ids.sort();
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

fn parse_event_type(s: &str) -> Result<EventType, String> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| format!("unknown event type '{}'", s))
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Chains Configuration");
    println!("{}", "=".repeat(40));
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!("  Journal:  {}", config::journal_dir()?.display());
    println!(
        "  Triggers: {}",
        cfg.triggers
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!();
    println!("Retry policy:");
    println!("  Max retries:   {}", cfg.retry.max_retries);
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!("  Multiplier:    {}", cfg.retry.backoff_multiplier);
    println!();
    println!("Safety limits:");
    println!("  Max steps:        {}", cfg.limits.max_steps);
    println!("  Max payload size: {} bytes", cfg.limits.max_payload_bytes);
    println!("  Step timeout:     {}s", cfg.limits.step_timeout_seconds);
    println!("  Run timeout:      {}s", cfg.limits.run_timeout_seconds);

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
