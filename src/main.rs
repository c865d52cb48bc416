//! Email pipeline command line entry point

use email_agent_pipeline::agent::{
    AgentFactory, AgentOrchestrator, MetricsObserver, TracingObserver,
};
use email_agent_pipeline::config::AppConfig;
use email_agent_pipeline::email::Email;
use email_agent_pipeline::llm::create_provider;
use email_agent_pipeline::observability::{init_default_logging, metrics};
use email_agent_pipeline::pipeline::Pipeline;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Multi-agent email processing pipeline
#[derive(Parser)]
#[command(name = "email-pipeline")]
#[command(about = "Run email through a multi-stage LLM agent pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one email and print the result as JSON
    Run {
        /// JSON file holding the email
        #[arg(long, value_name = "FILE")]
        email: PathBuf,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// List configured agents
    Agents {
        /// Check provider health for every agent
        #[arg(long)]
        health: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting email pipeline v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { email } => run_email(config, &email).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Agents { health } => handle_agents_command(config, health).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AppConfig::load_from_file(path)?);
    }

    for path_str in ["pipeline.toml", "config/pipeline.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AppConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create pipeline.toml".into())
}

/// Wire provider, factory and orchestrator from configuration
fn build_orchestrator(
    config: &AppConfig,
) -> Result<Arc<AgentOrchestrator>, Box<dyn std::error::Error>> {
    let provider = create_provider(&config.llm)?;
    let factory = AgentFactory::from_config(config, provider);
    let agents = config
        .agents
        .iter()
        .map(|(agent_type, section)| (agent_type.clone(), section.configuration.clone()));
    let orchestrator = AgentOrchestrator::from_factory(&factory, agents)?;
    orchestrator.add_observer(Arc::new(TracingObserver));
    orchestrator.add_observer(Arc::new(MetricsObserver));
    Ok(Arc::new(orchestrator))
}

async fn run_email(config: AppConfig, email_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let email: Email = serde_json::from_str(&std::fs::read_to_string(email_path)?)?;
    let orchestrator = build_orchestrator(&config)?;
    let pipeline = Arc::new(Pipeline::from_config(&config, orchestrator.clone())?);

    let (execution_id, handle) = pipeline.spawn(email);
    info!(execution_id = %execution_id, "Processing email");

    tokio::pin!(handle);
    let outcome = tokio::select! {
        joined = &mut handle => joined?,
        _ = signal::ctrl_c() => {
            warn!("Received interrupt, cancelling after the current stage");
            pipeline.cancel_execution(execution_id);
            handle.await?
        }
    };

    orchestrator.shutdown().await;
    info!(metrics = ?metrics().snapshot(), "Run finished");

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            if let Some(execution) = pipeline.get_execution_status(execution_id) {
                println!("{}", serde_json::to_string_pretty(&execution)?);
            }
            Err(e.into())
        }
    }
}

fn handle_config_command(config: &AppConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    Ok(())
}

async fn handle_agents_command(
    config: AppConfig,
    health: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = build_orchestrator(&config)?;

    if health {
        let report = orchestrator.health_report().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for agent_type in orchestrator.available_types() {
            if let Some(agent) = orchestrator.get_agent(&agent_type) {
                println!("{agent_type}\t{}", agent.id());
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
