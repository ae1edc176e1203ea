//! Cadence CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence batch job orchestrator", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "CADENCE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a job catalog and print its execution order
    Validate {
        /// Path to the job catalog
        #[arg(default_value = "jobs.kdl")]
        path: PathBuf,
    },
    /// Run the scheduler until interrupted
    Run {
        /// Path to the job catalog
        #[arg(long, env = "CADENCE_JOBS", default_value = "jobs.kdl")]
        jobs: PathBuf,
        /// Path to the system configuration
        #[arg(long, env = "CADENCE_CONFIG", default_value = "cadence.kdl")]
        config: PathBuf,
    },
    /// Run one job now and wait for it and its dependents
    Trigger {
        /// Job name
        job: String,
        /// Path to the job catalog
        #[arg(long, env = "CADENCE_JOBS", default_value = "jobs.kdl")]
        jobs: PathBuf,
        /// Path to the system configuration
        #[arg(long, env = "CADENCE_CONFIG", default_value = "cadence.kdl")]
        config: PathBuf,
        /// Parameter override, as key=value
        #[arg(long = "param", value_parser = commands::parse_param)]
        params: Vec<(String, String)>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Run { jobs, config } => {
            commands::run::run(&jobs, &config).await?;
        }
        Commands::Trigger {
            job,
            jobs,
            config,
            params,
        } => {
            commands::trigger::trigger(&jobs, &config, &job, params, cli.json).await?;
        }
    }

    Ok(())
}
