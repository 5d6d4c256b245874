use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{Config, validate_threshold};
use crate::database::Database;
use crate::database::queries::SourceQueries;
use crate::embeddings::{Embedder, OllamaClient, Unavailable};
use crate::etl::{EtlPlan, RunOutcome, run_etl};
use crate::monitoring::{RunMonitor, RunSummary};
use crate::retry::{RetryPolicy, with_retry};
use crate::schema::SchemaRegistry;
use crate::text::TextNormalizer;

/// Print every configured ETL type with its description
#[inline]
pub fn list_etl_types(config: &Config) {
    if config.etl_types.is_empty() {
        println!("No ETL types are configured.");
        println!("Add an [etl_types.<name>] section to the configuration file.");
        return;
    }

    println!("ETL types ({} total):", config.etl_types.len());
    println!();
    for (key, etl) in &config.etl_types {
        println!("{}", key);
        if !etl.description.is_empty() {
            println!("   {}", etl.description);
        }
        let mode = if etl.multiple_values {
            "multi-valued"
        } else {
            "single-valued"
        };
        println!(
            "   {}.{} -> {} ({})",
            etl.source_table, etl.value_field, etl.table_name, mode
        );
    }
}

/// Create every configured table that does not exist yet
#[inline]
pub async fn init_schema(config: &Config) -> Result<()> {
    let registry = SchemaRegistry::from_config(config)?;
    let database = connect(config).await?;

    database.ensure_schema(&registry).await?;
    println!(
        "Schema ready: {} tables in {}",
        registry.tables().count(),
        config.database_path().display()
    );

    database.close().await;
    Ok(())
}

/// Unmapped backlog per ETL type and embedding backend health
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    let registry = SchemaRegistry::from_config(config)?;

    println!("Linkage ETL status");
    println!("{}", "=".repeat(40));
    println!();

    println!("Embedding backend:");
    match OllamaClient::new(&config.embedding).and_then(|client| client.health_check()) {
        Ok(()) => println!(
            "   Ollama: healthy ({}, model {})",
            config.embedding.base_url()?,
            config.embedding.model
        ),
        Err(e) => println!("   Ollama: unavailable - {:#}", e),
    }
    println!();

    let database = connect(config).await?;
    let mut conn = database
        .pool()
        .acquire()
        .await
        .context("Failed to acquire database connection")?;

    println!("Unmapped records:");
    for key in config.etl_types.keys() {
        let plan = EtlPlan::resolve(config, &registry, key)?;
        match SourceQueries::count_unmapped(&mut conn, &plan.source_select()).await {
            Ok(count) => println!("   {}: {}", key, count),
            Err(e) => println!("   {}: unavailable - {:#}", key, e),
        }
    }

    drop(conn);
    database.close().await;
    Ok(())
}

/// Run one ETL type and print its summary. Fails when the run outcome is a failure.
#[inline]
pub async fn run(
    config: &Config,
    etl_type: &str,
    report: Option<&Path>,
    threshold: Option<f32>,
) -> Result<RunSummary> {
    if !config.etl_types.contains_key(etl_type) {
        println!("Unknown ETL type: {}", etl_type);
        println!("Available types:");
        for key in config.etl_types.keys() {
            println!("   {}", key);
        }
        bail!("Unknown ETL type: {}", etl_type);
    }
    if let Some(threshold) = threshold {
        validate_threshold(threshold).context("Invalid --threshold")?;
    }

    let registry = SchemaRegistry::from_config(config)?;
    let plan = EtlPlan::resolve(config, &registry, etl_type)?;

    let summary = match open_with_schema(config, &registry).await {
        Ok(database) => {
            let embedder = connect_embedder(config);
            let normalizer = TextNormalizer::new(config.matching.term_expansions.clone());
            let retry = RetryPolicy::from(&config.retry);

            info!("Starting ETL run for '{}'", etl_type);
            let summary = run_etl(&database, plan, embedder, normalizer, &retry, threshold).await;
            database.close().await;
            summary
        }
        Err(e) => {
            error!("ETL initialization failed: {:#}", e);
            RunMonitor::start(etl_type).finish(
                RunOutcome::Failed {
                    message: format!("{:#}", e),
                },
                0,
            )
        }
    };

    println!("{}", summary);
    if let Some(path) = report {
        summary.write_json(path)?;
        println!("Report written to {}", path.display());
    }

    if let RunOutcome::Failed { message } = &summary.outcome {
        bail!("ETL run '{}' failed: {}", etl_type, message);
    }

    Ok(summary)
}

async fn open_with_schema(config: &Config, registry: &SchemaRegistry) -> Result<Database> {
    let database = connect(config).await?;
    database.ensure_schema(registry).await?;
    Ok(database)
}

async fn connect(config: &Config) -> Result<Database> {
    let path_buf = config.database_path();
    let path = path_buf.as_path();
    let retry = RetryPolicy::from(&config.retry);

    with_retry(&retry, "Connecting to database", move || Database::new(path))
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))
}

/// The Ollama backend when healthy; otherwise an embedder that always fails,
/// which leaves the run on deterministic matching only.
fn connect_embedder(config: &Config) -> Arc<dyn Embedder> {
    let client = OllamaClient::new(&config.embedding)
        .map(|client| client.with_retry_policy(RetryPolicy::from(&config.retry)));

    match client.and_then(|client| client.health_check().map(|()| client)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Embedding backend unavailable: {:#}", e);
            Arc::new(Unavailable::new(format!("{:#}", e)))
        }
    }
}
