use clap::{Parser, Subcommand};
use linkage_etl::Result;
use linkage_etl::commands::{init_schema, list_etl_types, run, show_status};
use linkage_etl::config::{Config, resolve_config_path};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "linkage-etl")]
#[command(about = "Resolves free-text source values to canonical entities")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured ETL types
    List,
    /// Create all configured tables if missing
    InitSchema,
    /// Show the unmapped backlog and embedding backend health
    Status,
    /// Run one ETL type
    Run {
        /// ETL type key from the configuration file
        etl_type: String,
        /// Write the run summary as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
        /// Similarity threshold overriding the configured one
        #[arg(long)]
        threshold: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(resolve_config_path(cli.config)?)?;

    match cli.command {
        Commands::List => {
            list_etl_types(&config);
        }
        Commands::InitSchema => {
            init_schema(&config).await?;
        }
        Commands::Status => {
            show_status(&config).await?;
        }
        Commands::Run {
            etl_type,
            report,
            threshold,
        } => {
            run(&config, &etl_type, report.as_deref(), threshold).await?;
        }
    }

    Ok(())
}
