//! Run metrics and reporting
//!
//! A `RunMonitor` collects counts and timings while a run executes and turns
//! them into a `RunSummary` however the run ends.


use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

/// Errors kept in the summary; older ones are dropped.
pub const ERROR_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Direct,
    Ai,
    Missed,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Ai => write!(f, "ai"),
            Self::Missed => write!(f, "missed"),
        }
    }
}

/// Collaborator receiving run metrics.
pub trait MetricsSink {
    fn record_timing(&mut self, label: &str, duration: Duration);
    fn record_success(&mut self, duration: Duration);
    fn record_error(&mut self, kind: &str, message: &str, record_id: Option<i64>);
    fn record_match(&mut self, kind: MatchKind);
}

/// Awaits `future` and records its elapsed time under `label`.
pub async fn with_timing<S, F>(sink: &mut S, label: &str, future: F) -> F::Output
where
    S: MetricsSink + ?Sized,
    F: Future,
{
    let started = Instant::now();
    let output = future.await;
    sink.record_timing(label, started.elapsed());
    output
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCounts {
    pub direct: u64,
    pub ai: u64,
    pub missed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub record_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct TimingAccumulator {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl TimingAccumulator {
    fn add(&mut self, duration: Duration) {
        if self.count == 0 || duration < self.min {
            self.min = duration;
        }
        if duration > self.max {
            self.max = duration;
        }
        self.count += 1;
        self.total += duration;
    }

    fn stats(&self) -> TimingStats {
        let average = if self.count == 0 {
            Duration::ZERO
        } else {
            self.total.div_f64(self.count as f64)
        };
        TimingStats {
            count: self.count,
            avg_ms: millis(average),
            min_ms: millis(self.min),
            max_ms: millis(self.max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Counters of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetrics {
    pub records_processed: u64,
    pub records_failed: u64,
    pub matches: MatchCounts,
    pub error_counts: BTreeMap<String, u64>,
    pub recent_errors: VecDeque<ErrorRecord>,
    processing: TimingAccumulator,
    timings: BTreeMap<String, TimingAccumulator>,
}

impl RunMetrics {
    pub fn success_rate(&self) -> f64 {
        let total = self.records_processed + self.records_failed;
        if total == 0 {
            0.0
        } else {
            self.records_processed as f64 / total as f64
        }
    }

    pub fn average_processing_time(&self) -> Duration {
        if self.processing.count == 0 {
            Duration::ZERO
        } else {
            self.processing.total.div_f64(self.processing.count as f64)
        }
    }

    pub fn timing_stats(&self, label: &str) -> Option<TimingStats> {
        self.timings.get(label).map(TimingAccumulator::stats)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// No unmapped records remain
    Done,
    IterationCapReached,
    Failed { message: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::IterationCapReached => write!(f, "iteration cap reached"),
            Self::Failed { message } => write!(f, "failed: {}", message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunMonitor {
    etl_type: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    metrics: RunMetrics,
}

impl RunMonitor {
    pub fn start(etl_type: &str) -> Self {
        let run_id = Uuid::new_v4();
        info!("Starting run {} for ETL type '{}'", run_id, etl_type);
        Self {
            etl_type: etl_type.to_string(),
            run_id,
            started_at: Utc::now(),
            started: Instant::now(),
            metrics: RunMetrics::default(),
        }
    }

    #[inline]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    #[inline]
    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Close the run and log its metrics
    pub fn finish(self, outcome: RunOutcome, iterations: u32) -> RunSummary {
        let metrics = &self.metrics;
        let summary = RunSummary {
            etl_type: self.etl_type.clone(),
            run_id: self.run_id,
            outcome,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: millis(self.started.elapsed()),
            iterations,
            records_processed: metrics.records_processed,
            records_failed: metrics.records_failed,
            matches: metrics.matches,
            success_rate: metrics.success_rate(),
            average_processing_ms: millis(metrics.average_processing_time()),
            timings: metrics
                .timings
                .iter()
                .map(|(label, acc)| (label.clone(), acc.stats()))
                .collect(),
            error_counts: metrics.error_counts.clone(),
            recent_errors: metrics.recent_errors.iter().cloned().collect(),
        };

        info!("Run metrics:\n{}", summary);
        summary
    }
}

impl MetricsSink for RunMonitor {
    fn record_timing(&mut self, label: &str, duration: Duration) {
        self.metrics
            .timings
            .entry(label.to_string())
            .or_default()
            .add(duration);
    }

    fn record_success(&mut self, duration: Duration) {
        self.metrics.records_processed += 1;
        self.metrics.processing.add(duration);
    }

    fn record_error(&mut self, kind: &str, message: &str, record_id: Option<i64>) {
        self.metrics.records_failed += 1;
        *self
            .metrics
            .error_counts
            .entry(kind.to_string())
            .or_insert(0) += 1;

        if self.metrics.recent_errors.len() == ERROR_HISTORY_LIMIT {
            self.metrics.recent_errors.pop_front();
        }
        self.metrics.recent_errors.push_back(ErrorRecord {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            message: message.to_string(),
            record_id,
        });
    }

    fn record_match(&mut self, kind: MatchKind) {
        match kind {
            MatchKind::Direct => self.metrics.matches.direct += 1,
            MatchKind::Ai => self.metrics.matches.ai += 1,
            MatchKind::Missed => self.metrics.matches.missed += 1,
        }
    }
}

/// Final report of a run, produced on every termination path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub etl_type: String,
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub iterations: u32,
    pub records_processed: u64,
    pub records_failed: u64,
    pub matches: MatchCounts,
    pub success_rate: f64,
    pub average_processing_ms: f64,
    pub timings: BTreeMap<String, TimingStats>,
    pub error_counts: BTreeMap<String, u64>,
    pub recent_errors: Vec<ErrorRecord>,
}

impl RunSummary {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory: {}", parent.display())
            })?;
        }

        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize run summary")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ETL type: {}", self.etl_type)?;
        writeln!(f, "Run: {}", self.run_id)?;
        writeln!(f, "Outcome: {}", self.outcome)?;
        writeln!(f, "Duration: {:.2}s", self.duration_ms / 1000.0)?;
        writeln!(f, "Iterations: {}", self.iterations)?;
        writeln!(f, "Records processed: {}", self.records_processed)?;
        writeln!(f, "Records failed: {}", self.records_failed)?;
        writeln!(f, "Success rate: {:.2}%", self.success_rate * 100.0)?;
        writeln!(
            f,
            "Matches: {} direct, {} ai, {} missed",
            self.matches.direct, self.matches.ai, self.matches.missed
        )?;
        write!(
            f,
            "Average processing time: {:.3}ms",
            self.average_processing_ms
        )?;

        for (label, stats) in &self.timings {
            write!(
                f,
                "\n  {}: {:.3}ms avg, {:.3}ms min, {:.3}ms max ({} calls)",
                label, stats.avg_ms, stats.min_ms, stats.max_ms, stats.count
            )?;
        }
        for (kind, count) in &self.error_counts {
            write!(f, "\n  {} errors: {}", kind, count)?;
        }
        Ok(())
    }
}

#[inline]
fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
