use clap::{Parser, Subcommand};
use std::time::Duration;

mod commands;
mod error;

use error::CliResult;

#[derive(Parser, Debug)]
#[command(name = "taskmesh", version)]
#[command(about = "Taskmesh CLI - run workers, submit tasks, and inspect the orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a queue worker with the built-in agents until Ctrl-C
    Worker {
        /// Seconds one poll blocks on an empty queue
        #[arg(long, default_value_t = 1)]
        poll_interval: u64,
    },
    /// Route a task to an agent type
    Submit {
        /// Agent type, e.g. Echo or document_analyzer
        #[arg(long)]
        agent_type: String,
        /// Task data as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Show trace counters and queue statistics
    Stats,
    /// Show the trace of a task
    Trace {
        /// Task (message) id
        task_id: String,
    },
    /// List dead-lettered tasks, oldest first
    Dlq {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Inspect or change agent configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the configuration of an agent type
    Show {
        agent_type: String,
    },
    /// Merge key=value settings into an agent type's configuration
    Set {
        agent_type: String,
        /// Values are read as JSON when they parse, as strings otherwise
        #[arg(required = true)]
        settings: Vec<String>,
    },
}

async fn run(command: Commands) -> CliResult<()> {
    match command {
        Commands::Worker { poll_interval } => {
            commands::run_worker(Duration::from_secs(poll_interval)).await
        }
        Commands::Submit { agent_type, data } => commands::submit(&agent_type, &data).await,
        Commands::Stats => commands::stats().await,
        Commands::Trace { task_id } => commands::trace(&task_id).await,
        Commands::Dlq { limit } => commands::dead_letters(limit).await,
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show { agent_type } => commands::config_show(&agent_type).await,
            ConfigCommands::Set {
                agent_type,
                settings,
            } => commands::config_set(&agent_type, &settings).await,
        },
    }
}

#[tokio::main]
async fn main() {
    // Initialize JSON logging once.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .try_init();

    let cli = Cli::parse();

    if let Err(e) = run(cli.command).await {
        tracing::error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}
