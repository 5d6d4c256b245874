use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{EtlPlan, WriteBack};
use crate::database::{Database, Session};
use crate::database::models::{SourceRecord, SourceSelect};
use crate::database::queries::{JunctionQueries, SourceQueries, TargetQueries};
use crate::embeddings::Embedder;
use crate::matching::{
    ContextEntry, DeterministicMatcher, IdMap, SemanticMatcher, SynonymLearner,
};
use crate::monitoring::{
    MatchKind, MetricsSink, RunMonitor, RunOutcome, RunSummary, with_timing,
};
use crate::retry::{RetryPolicy, with_retry};
use crate::text::TextNormalizer;

/// Result of resolving one candidate value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueOutcome {
    /// Excluded by validation; not an error
    ValidationSkip,
    /// Nothing reached the threshold; the value stays eligible for a later run
    MatchMiss,
    Direct { target_id: i64 },
    Semantic { target_id: i64, confidence: f32 },
}

impl ValueOutcome {
    #[inline]
    pub fn target_id(&self) -> Option<i64> {
        match self {
            Self::Direct { target_id } | Self::Semantic { target_id, .. } => Some(*target_id),
            Self::ValidationSkip | Self::MatchMiss => None,
        }
    }
}

/// Result of processing one source record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Resolved ids were written and committed
    Mapped(Vec<i64>),
    /// No candidate resolved; nothing was written
    Unmatched,
    /// The record no longer needs mapping
    Skipped,
    /// The record's transaction was rolled back
    Failed(String),
}

/// Matching engine and persistence wired for one ETL type.
#[derive(Debug)]
pub struct EtlRunner<'a> {
    database: &'a Database,
    plan: EtlPlan,
    select: SourceSelect,
    direct: DeterministicMatcher,
    semantic: SemanticMatcher,
    id_map: IdMap,
    learner: Option<SynonymLearner>,
    threshold_override: Option<f32>,
}

impl<'a> EtlRunner<'a> {
    /// Load the canonical options and embed them. Embedding failures degrade to
    /// deterministic-only matching; failing to load options is fatal.
    pub async fn initialize<S: MetricsSink + ?Sized>(
        database: &'a Database,
        plan: EtlPlan,
        embedder: Arc<dyn Embedder>,
        normalizer: TextNormalizer,
        retry: &RetryPolicy,
        sink: &mut S,
    ) -> Result<Self> {
        let target = &plan.target;
        let options = with_timing(
            sink,
            "load_options",
            with_retry(retry, "Loading canonical options", || async move {
                let mut session = database.session().await?;
                TargetQueries::list_options(session.conn(), target).await
            }),
        )
        .await
        .context("Failed to load canonical options")?;

        info!(
            "Loaded {} canonical options from {}",
            options.len(),
            plan.target.name
        );

        let (names, id_map) = IdMap::from_options(options);
        let semantic = SemanticMatcher::new(
            embedder,
            names,
            normalizer,
            plan.similarity_threshold,
        );
        if let Some(reason) = semantic.disabled_reason() {
            warn!(
                "Semantic matching disabled for '{}' ({}); only direct matches will resolve",
                plan.etl_type, reason
            );
        }

        let direct = DeterministicMatcher::new(plan.target.clone(), plan.synonyms.clone());
        let learner = plan
            .synonyms
            .clone()
            .map(|synonyms| SynonymLearner::new(synonyms, &plan.target.key));

        Ok(Self {
            database,
            select: plan.source_select(),
            plan,
            direct,
            semantic,
            id_map,
            learner,
            threshold_override: None,
        })
    }

    /// Caller threshold taking precedence over the plan's
    #[inline]
    pub fn with_threshold(mut self, threshold: Option<f32>) -> Self {
        self.threshold_override = threshold;
        self
    }

    #[inline]
    pub fn plan(&self) -> &EtlPlan {
        &self.plan
    }

    #[inline]
    pub fn semantic(&self) -> &SemanticMatcher {
        &self.semantic
    }

    /// Run batches until the backlog is exhausted or the iteration cap is hit.
    /// Returns the outcome and the number of batches processed.
    pub async fn run<S: MetricsSink + ?Sized>(&self, sink: &mut S) -> (RunOutcome, u32) {
        let mut iterations = 0;
        match self.run_batches(sink, &mut iterations).await {
            Ok(outcome) => (outcome, iterations),
            Err(e) => {
                error!("ETL process '{}' failed: {:#}", self.plan.etl_type, e);
                (
                    RunOutcome::Failed {
                        message: format!("{:#}", e),
                    },
                    iterations,
                )
            }
        }
    }

    async fn run_batches<S: MetricsSink + ?Sized>(
        &self,
        sink: &mut S,
        iterations: &mut u32,
    ) -> Result<RunOutcome> {
        info!(
            "Starting {} ETL process with batch_size={}, max_iterations={}, {}",
            self.plan.etl_type,
            self.plan.batch_size,
            self.plan.max_iterations,
            if self.plan.is_multi_valued() {
                "junction write-back"
            } else {
                "mapping id write-back"
            }
        );

        let mut after_id = None;
        let mut total_mapped = 0u64;

        loop {
            if *iterations >= self.plan.max_iterations {
                info!(
                    "Reached the iteration cap ({}) with records possibly remaining",
                    self.plan.max_iterations
                );
                return Ok(RunOutcome::IterationCapReached);
            }

            info!("Fetching batch {}", *iterations + 1);
            let records = with_timing(&mut *sink, "fetch_batch", self.fetch_batch(after_id))
                .await
                .context("Failed to fetch unmapped records")?;

            if records.is_empty() {
                info!("No more unmapped records to process");
                return Ok(RunOutcome::Done);
            }

            info!("Processing {} records", records.len());
            let bar = progress_bar(records.len() as u64);
            let mut mapped_in_batch = 0u64;

            for (i, record) in records.iter().enumerate() {
                after_id = Some(record.id);

                if let RecordOutcome::Mapped(_) = self.process_record(record.id, &mut *sink).await {
                    mapped_in_batch += 1;
                }

                let done = i + 1;
                bar.set_position(done as u64);
                if done % self.plan.progress_interval.max(1) as usize == 0 {
                    info!("Processed {}/{} records in current batch", done, records.len());
                }
            }
            bar.finish_and_clear();

            *iterations += 1;
            total_mapped += mapped_in_batch;
            info!(
                "Completed batch {}: mapped {} records. Total mapped: {}",
                iterations, mapped_in_batch, total_mapped
            );

            // A short page means nothing was left past the cursor
            if records.len() < self.plan.batch_size as usize {
                info!("Backlog exhausted");
                return Ok(RunOutcome::Done);
            }
        }
    }

    async fn fetch_batch(&self, after_id: Option<i64>) -> Result<Vec<SourceRecord>> {
        let mut conn = self
            .database
            .pool()
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        SourceQueries::fetch_unmapped(&mut conn, &self.select, after_id, self.plan.batch_size)
            .await
    }

    /// Process one record in its own transaction. Errors roll back this record only.
    pub async fn process_record<S: MetricsSink + ?Sized>(
        &self,
        record_id: i64,
        sink: &mut S,
    ) -> RecordOutcome {
        let started = Instant::now();

        let mut session = match self.database.session().await {
            Ok(session) => session,
            Err(e) => {
                error!("Error processing record {}: {:#}", record_id, e);
                sink.record_error("processing", &format!("{:#}", e), Some(record_id));
                return RecordOutcome::Failed(format!("{:#}", e));
            }
        };

        let resolved = self
            .resolve_record(session.conn(), record_id, &mut *sink)
            .await;

        match resolved {
            Ok(Some(ids)) if !ids.is_empty() => match session.commit().await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    sink.record_timing("process_record", elapsed);
                    sink.record_success(elapsed);
                    debug!("Record {} mapped to {:?}", record_id, ids);
                    RecordOutcome::Mapped(ids)
                }
                Err(e) => {
                    error!("Error committing record {}: {:#}", record_id, e);
                    sink.record_error("processing", &format!("{:#}", e), Some(record_id));
                    RecordOutcome::Failed(format!("{:#}", e))
                }
            },
            Ok(Some(_)) => {
                sink.record_timing("process_record", started.elapsed());
                rollback(session, record_id).await;
                RecordOutcome::Unmatched
            }
            Ok(None) => {
                rollback(session, record_id).await;
                RecordOutcome::Skipped
            }
            Err(e) => {
                error!("Error processing record {}: {:#}", record_id, e);
                sink.record_error("processing", &format!("{:#}", e), Some(record_id));
                rollback(session, record_id).await;
                RecordOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    /// Resolve and write back within the record's transaction. `None` when the
    /// record was mapped concurrently or has no value.
    async fn resolve_record<S: MetricsSink + ?Sized>(
        &self,
        conn: &mut SqliteConnection,
        record_id: i64,
        sink: &mut S,
    ) -> Result<Option<Vec<i64>>> {
        let Some(record) = SourceQueries::reload_unmapped(conn, &self.select, record_id).await?
        else {
            debug!("Record {} no longer needs mapping", record_id);
            return Ok(None);
        };
        let Some(raw_value) = record.value.as_deref().filter(|v| !v.is_empty()) else {
            return Ok(None);
        };

        let context = self.plan.context_for(&record);
        let mut resolved = Vec::new();

        for value in self.plan.splitter.split(raw_value)? {
            let outcome = self.resolve_value(conn, &value, &context).await?;
            match &outcome {
                ValueOutcome::ValidationSkip => info!("Skipping invalid value: '{}'", value),
                ValueOutcome::MatchMiss => sink.record_match(MatchKind::Missed),
                ValueOutcome::Direct { .. } => sink.record_match(MatchKind::Direct),
                ValueOutcome::Semantic { .. } => sink.record_match(MatchKind::Ai),
            }
            resolved.extend(outcome.target_id());
        }

        let resolved: Vec<i64> = resolved.into_iter().unique().collect();
        if resolved.is_empty() {
            return Ok(Some(resolved));
        }

        match &self.plan.write_back {
            WriteBack::MappingId { field } => {
                SourceQueries::set_mapping_id(
                    conn,
                    &self.plan.source.name,
                    field,
                    record.id,
                    resolved[0],
                )
                .await?;
                Ok(Some(vec![resolved[0]]))
            }
            WriteBack::Junction {
                table,
                source_field,
                target_field,
            } => {
                for target_id in &resolved {
                    JunctionQueries::insert(
                        conn,
                        table,
                        source_field,
                        target_field,
                        record.id,
                        *target_id,
                    )
                    .await?;
                }
                Ok(Some(resolved))
            }
        }
    }

    /// Validation, then deterministic lookup, then semantic fallback with synonym learning.
    pub async fn resolve_value(
        &self,
        conn: &mut SqliteConnection,
        value: &str,
        context: &[ContextEntry],
    ) -> Result<ValueOutcome> {
        if !self.plan.validator.is_valid(value)? {
            return Ok(ValueOutcome::ValidationSkip);
        }

        if let Some(hit) = self.direct.find_direct(conn, value).await? {
            return Ok(ValueOutcome::Direct {
                target_id: hit.target_id(),
            });
        }

        let Some(result) = self
            .semantic
            .find_best_match(value, context, self.threshold_override)
        else {
            return Ok(ValueOutcome::MatchMiss);
        };

        let target_id = self.id_map.resolve(result.matched_index).ok_or_else(|| {
            anyhow::anyhow!(
                "Match position {} has no canonical id",
                result.matched_index
            )
        })?;

        match &self.learner {
            Some(learner) => {
                learner
                    .learn(conn, value, target_id, result.confidence)
                    .await
                    .context("Failed to record synonym")?;
            }
            None => debug!("No dictionary table configured; synonym not recorded"),
        }

        Ok(ValueOutcome::Semantic {
            target_id,
            confidence: result.confidence,
        })
    }
}

async fn rollback(session: Session, record_id: i64) {
    if let Err(e) = session.rollback().await {
        warn!("Failed to roll back record {}: {:#}", record_id, e);
    }
}

fn progress_bar(length: u64) -> ProgressBar {
    if !console::user_attended_stderr() {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(length);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{pos}/{len}] Mapping records {msg}")
    {
        bar.set_style(style);
    }
    bar
}

/// Execute one ETL type end to end. A summary is produced on every path,
/// including initialization failures.
pub async fn run_etl(
    database: &Database,
    plan: EtlPlan,
    embedder: Arc<dyn Embedder>,
    normalizer: TextNormalizer,
    retry: &RetryPolicy,
    threshold: Option<f32>,
) -> RunSummary {
    let mut monitor = RunMonitor::start(&plan.etl_type);

    let runner =
        match EtlRunner::initialize(database, plan, embedder, normalizer, retry, &mut monitor)
            .await
        {
            Ok(runner) => runner.with_threshold(threshold),
            Err(e) => {
                error!("ETL initialization failed: {:#}", e);
                return monitor.finish(
                    RunOutcome::Failed {
                        message: format!("{:#}", e),
                    },
                    0,
                );
            }
        };

    let (outcome, iterations) = runner.run(&mut monitor).await;
    monitor.finish(outcome, iterations)
}
