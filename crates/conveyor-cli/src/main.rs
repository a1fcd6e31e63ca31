//! Conveyor CLI tool.

use clap::{Parser, Subcommand};
use conveyor_core::queue::Priority;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor CI/CD trigger engine CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "CONVEYOR_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage the job queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Change live scheduler settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Resume dispatching queued jobs
    Start,
    /// Pause dispatching; running jobs continue
    Stop,
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "conveyor.kdl")]
        path: String,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show pending and running entries
    Status,
    /// Show queue counters
    Stats,
    /// Queue a configured job
    Add {
        /// Job ID from the configuration
        job_id: String,
        /// Dispatch priority (high, medium, low)
        #[arg(long, default_value = "medium")]
        priority: Priority,
        /// Override the job's retry budget
        #[arg(long)]
        max_retries: Option<u32>,
        /// Override the advisory duration in seconds
        #[arg(long)]
        estimated_time: Option<u64>,
    },
    /// Cancel a queued or running entry
    Cancel {
        /// Queue entry ID
        id: String,
    },
    /// Show a single entry
    Show {
        /// Queue entry ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Update concurrency and resource limits
    Set {
        #[arg(long)]
        max_concurrent_jobs: Option<usize>,
        #[arg(long)]
        resource_threshold: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Queue { command } => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            match command {
                QueueCommands::Status => commands::queue::status(&client).await?,
                QueueCommands::Stats => commands::queue::stats(&client).await?,
                QueueCommands::Add {
                    job_id,
                    priority,
                    max_retries,
                    estimated_time,
                } => {
                    commands::queue::add(&client, &job_id, priority, max_retries, estimated_time)
                        .await?
                }
                QueueCommands::Cancel { id } => commands::queue::cancel(&client, &id).await?,
                QueueCommands::Show { id } => commands::queue::show(&client, &id).await?,
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Set {
                max_concurrent_jobs,
                resource_threshold,
            } => {
                let client = commands::ApiClient::new(&cli.api_url)?;
                commands::config::set(&client, max_concurrent_jobs, resource_threshold).await?;
            }
        },
        Commands::Start => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            commands::toggle(&client, "start").await?;
        }
        Commands::Stop => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            commands::toggle(&client, "stop").await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_queue_add_parses_priority() {
        let cli = Cli::try_parse_from([
            "conveyor",
            "--api-url",
            "http://ci:3000",
            "queue",
            "add",
            "api",
            "--priority",
            "high",
        ])
        .unwrap();
        assert_eq!(cli.api_url, "http://ci:3000");
        match cli.command {
            Commands::Queue {
                command: QueueCommands::Add {
                    job_id, priority, ..
                },
            } => {
                assert_eq!(job_id, "api");
                assert_eq!(priority, Priority::High);
            }
            _ => panic!("expected queue add"),
        }

        assert!(
            Cli::try_parse_from(["conveyor", "queue", "add", "api", "--priority", "urgent"])
                .is_err()
        );
    }
}
