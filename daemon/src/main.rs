use anyhow::Result;
use clap::{Parser, Subcommand};
use o365_sync::model::ObjectType;
use o365_sync::store::JobQueue;
use o365_sync::{HostEvent, MemoryStore, TaskRequest};
use std::path::{Path, PathBuf};
use tracing::info;

mod config;
mod daemon;
mod routes;
mod scheduler;
mod telemetry;

use config::DaemonConfig;
use daemon::{SyncDaemon, SyncRuntime};
use telemetry::TelemetrySystem;

#[derive(Parser)]
#[command(name = "o365-sync-daemon")]
#[command(about = "Keeps local groups, calendars and users in sync with Microsoft 365")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level for one-shot commands
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run schedules, the dispatcher and the HTTP intake until interrupted
    Start,
    /// Run one task now
    RunTask {
        /// Registered task name, e.g. group_membership
        name: String,

        /// Task input as JSON
        #[arg(long)]
        data: Option<String>,
    },
    /// Handle one host event given as JSON, then run the work it defers
    Event {
        payload: String,
    },
    /// Summarise the persisted sync state
    Status,
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigActions,
    },
}

#[derive(Subcommand)]
enum ConfigActions {
    /// Validate configuration file
    Validate,
    /// Show current configuration
    Show,
    /// Generate default configuration
    Generate {
        /// Output path for configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = DaemonConfig::resolve_path(cli.config.as_ref());

    match cli.command {
        Commands::Start => {
            let config = DaemonConfig::load(&config_path).await?;
            let mut telemetry = TelemetrySystem::new(config.telemetry.clone())?;
            telemetry.initialize_logging()?;
            info!("Loaded configuration from {}", config_path.display());

            SyncDaemon::new(config, telemetry)?.run().await
        }
        Commands::RunTask { name, data } => {
            telemetry::init_basic_logging(&cli.log_level)?;
            let data = match data {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            };
            run_task(&config_path, TaskRequest::new(name, data)).await
        }
        Commands::Event { payload } => {
            telemetry::init_basic_logging(&cli.log_level)?;
            let event: HostEvent = serde_json::from_str(&payload)?;
            handle_event(&config_path, &event).await
        }
        Commands::Status => {
            telemetry::init_basic_logging(&cli.log_level)?;
            show_status(&config_path).await
        }
        Commands::Config { action } => {
            telemetry::init_basic_logging(&cli.log_level)?;
            match action {
                ConfigActions::Validate => validate_config(&config_path).await,
                ConfigActions::Show => show_config(&config_path).await,
                ConfigActions::Generate { output } => generate_config(output.as_ref()).await,
            }
        }
    }
}

async fn load_runtime(config_path: &Path) -> Result<SyncRuntime> {
    let config = DaemonConfig::load(config_path).await?;
    config.validate()?;
    SyncRuntime::build(&config)
}

async fn run_task(config_path: &Path, request: TaskRequest) -> Result<()> {
    let runtime = load_runtime(config_path).await?;
    let run = runtime.run_task(&request).await?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

async fn handle_event(config_path: &Path, event: &HostEvent) -> Result<()> {
    let runtime = load_runtime(config_path).await?;
    let runs = runtime.handle_event_inline(event).await?;
    println!("Handled {:?}; ran {} deferred task(s)", event.kind, runs.len());
    for run in &runs {
        println!(
            "  {}: processed {}, skipped {}, mutations {}, errors {}",
            run.operation,
            run.processed,
            run.skipped,
            run.total_mutations(),
            run.errors.total_errors
        );
    }
    Ok(())
}

async fn show_status(config_path: &Path) -> Result<()> {
    let config = DaemonConfig::load(config_path).await?;
    let store = MemoryStore::open(&config.store.path)?;
    let snapshot = store.snapshot();

    let active = |object_type: ObjectType| {
        snapshot
            .sync
            .mappings
            .iter()
            .filter(|m| m.object_type == object_type && !m.is_soft_deleted())
            .count()
    };
    let soft_deleted = snapshot.sync.mappings.iter().filter(|m| m.is_soft_deleted()).count();

    println!("Store: {}", config.store.path.display());
    println!("User mappings: {}", active(ObjectType::User));
    println!("Group mappings: {} ({} soft-deleted)", active(ObjectType::Group), soft_deleted);
    println!("Event mappings: {}", snapshot.sync.event_mappings.len());
    println!("Calendar subscriptions: {}", snapshot.sync.subscriptions.len());
    println!("Queued access jobs: {}", store.pending_access_jobs().len());
    for (key, cursor) in &snapshot.sync.cursors {
        let last_run = cursor
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let resumable = if cursor.skip_token.is_some() { " (mid-sequence)" } else { "" };
        println!("Cursor {:?}: last run {}{}", key, last_run, resumable);
    }
    Ok(())
}

async fn validate_config(config_path: &Path) -> Result<()> {
    info!("Validating configuration at {}", config_path.display());

    let result = match DaemonConfig::load(config_path).await {
        Ok(config) => config.validate().map(|_| config),
        Err(e) => Err(e),
    };
    match result {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("Directory enabled: {}", config.directory.directory_enabled);
            println!("Schedules configured: {}", config.schedules.len());
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

async fn show_config(config_path: &Path) -> Result<()> {
    let mut config = DaemonConfig::load(config_path).await?;
    if !config.client.client_secret.is_empty() {
        config.client.client_secret = "********".to_string();
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn generate_config(output_path: Option<&PathBuf>) -> Result<()> {
    let config = DaemonConfig::default();
    let toml_content = toml::to_string_pretty(&config)?;

    if let Some(path) = output_path {
        tokio::fs::write(path, toml_content).await?;
        println!("Configuration generated at {}", path.display());
    } else {
        println!("{}", toml_content);
    }

    Ok(())
}
