//! NeuroChron CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

#[derive(Parser)]
#[command(name = "neurochron")]
#[command(about = "NeuroChron brain-age pipeline CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// API server URL
    #[arg(long, env = "NEUROCHRON_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit an uploaded scan for brain age prediction
    Submit {
        /// Reference to the uploaded DICOM archive
        #[arg(long)]
        input: String,
        /// Chronological age in years (must be over 21)
        #[arg(long)]
        age: u32,
        /// Where to send the result
        #[arg(long)]
        contact: String,
    },
    /// Show a job's status
    Status {
        /// Job ID
        id: String,
    },
    /// List recent jobs
    List {
        /// Only show jobs in this status
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of jobs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a job
    Cancel {
        /// Job ID
        id: String,
    },
    /// Validate a system configuration file
    ValidateConfig {
        /// Path to the configuration file
        #[arg(default_value = neurochron_config::DEFAULT_CONFIG_PATH)]
        path: String,
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
        Commands::Submit {
            input,
            age,
            contact,
        } => {
            commands::jobs::submit(&cli.api_url, input, age, contact).await?;
        }
        Commands::Status { id } => {
            commands::jobs::status(&cli.api_url, &id).await?;
        }
        Commands::List { status, limit } => {
            commands::jobs::list(&cli.api_url, status.as_deref(), limit).await?;
        }
        Commands::Cancel { id } => {
            commands::jobs::cancel(&cli.api_url, &id).await?;
        }
        Commands::ValidateConfig { path } => {
            commands::validate_config(&path)?;
        }
    }

    Ok(())
}
