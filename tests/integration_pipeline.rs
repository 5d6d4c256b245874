#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// End-to-end runs of the batch orchestrator against a temporary SQLite database,
// with a keyword embedder standing in for the embedding backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use linkage_etl::config::Config;
use linkage_etl::database::Database;
use linkage_etl::database::models::NewSynonym;
use linkage_etl::database::queries::SynonymQueries;
use linkage_etl::embeddings::{Embedder, Unavailable};
use linkage_etl::etl::{EtlPlan, EtlRunner, RecordOutcome, RunOutcome, run_etl};
use linkage_etl::monitoring::{RunMonitor, RunSummary};
use linkage_etl::retry::RetryPolicy;
use linkage_etl::schema::SchemaRegistry;
use linkage_etl::text::TextNormalizer;

const CONFIG: &str = r#"
[settings]
batch_size = 10
max_iterations = 5
progress_interval = 2

[tables.source]
name = "accidents"
columns = { id = { type = "int unsigned", primary = true, auto_increment = true }, localisation = { type = "varchar(255)" }, circonstance = { type = "text" }, lieu_id = { type = "int unsigned", references = "target.id" } }

[tables.target]
name = "lieux"
columns = { id = { type = "int unsigned", primary = true, auto_increment = true }, name = { type = "varchar(120)" } }

[tables.junction]
name = "accident_lieux"
columns = { id = { type = "int unsigned", primary = true, auto_increment = true }, accident_id = { type = "int unsigned", references = "source.id" }, lieu_id = { type = "int unsigned", references = "target.id" } }

[etl_types.lieux]
description = "Body location of the injury"
source_table = "source"
table_name = "target"
dictionary_table = "dicosynonymes"
value_field = "localisation"
mapping_id_field = "lieu_id"
context_fields = [{ field = "circonstance", weight = 0.5 }]

[etl_types.lieux_multi]
source_table = "source"
table_name = "target"
value_field = "localisation"
multiple_values = true
junction_table = "junction"
junction_mapping = { source_field = "accident_id", target_field = "lieu_id" }
validation = { skip_if_matches = '\d+$' }
"#;

const VOCABULARY: &[&str] = &["genou", "main", "tete", "pied"];

/// One dimension per vocabulary word: 1.0 when the text contains it.
/// Texts without any vocabulary word embed to the zero vector.
#[derive(Default)]
struct KeywordEmbedder {
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for KeywordEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(VOCABULARY
            .iter()
            .map(|word| if text.contains(word) { 1.0 } else { 0.0 })
            .collect())
    }
}

struct Fixture {
    _temp_dir: TempDir,
    database: Database,
    config: Config,
    registry: SchemaRegistry,
}

impl Fixture {
    async fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let config = Config::from_toml_str(CONFIG)?;
        config.validate()?;
        let registry = SchemaRegistry::from_config(&config)?;

        let database = Database::new(temp_dir.path().join("linkage.db")).await?;
        database.ensure_schema(&registry).await?;

        for name in ["Genou", "Main", "Tête", "Pied"] {
            sqlx::query("INSERT INTO lieux (name) VALUES (?)")
                .bind(name)
                .execute(database.pool())
                .await?;
        }

        Ok(Self {
            _temp_dir: temp_dir,
            database,
            config,
            registry,
        })
    }

    async fn insert_accident(&self, localisation: &str) -> anyhow::Result<i64> {
        let id = sqlx::query("INSERT INTO accidents (localisation, circonstance) VALUES (?, ?)")
            .bind(localisation)
            .bind("chute")
            .execute(self.database.pool())
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    async fn target_id(&self, name: &str) -> anyhow::Result<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT id FROM lieux WHERE name = ?")
                .bind(name)
                .fetch_one(self.database.pool())
                .await?,
        )
    }

    async fn mapping_of(&self, accident_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(
            sqlx::query_scalar::<_, Option<i64>>("SELECT lieu_id FROM accidents WHERE id = ?")
                .bind(accident_id)
                .fetch_one(self.database.pool())
                .await?,
        )
    }

    async fn unmapped_count(&self) -> anyhow::Result<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accidents WHERE lieu_id IS NULL")
                .fetch_one(self.database.pool())
                .await?,
        )
    }

    async fn synonyms_named(&self, name: &str) -> anyhow::Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM dicosynonymes WHERE table_name = 'target' AND TRIM(name) = TRIM(?) COLLATE NOCASE",
        )
        .bind(name)
        .fetch_one(self.database.pool())
        .await?)
    }

    async fn run(
        &self,
        etl_type: &str,
        embedder: Arc<dyn Embedder>,
        threshold: Option<f32>,
    ) -> anyhow::Result<RunSummary> {
        let plan = EtlPlan::resolve(&self.config, &self.registry, etl_type)?;
        Ok(run_etl(
            &self.database,
            plan,
            embedder,
            TextNormalizer::default(),
            &RetryPolicy::none(),
            threshold,
        )
        .await)
    }
}

#[tokio::test]
async fn small_backlog_finishes_in_one_batch() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    for value in ["Genou", "Main", "Pied"] {
        fixture.insert_accident(value).await?;
    }

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.records_processed, 3);
    assert_eq!(summary.records_failed, 0);
    assert_eq!(summary.matches.direct, 3);
    assert_eq!(fixture.unmapped_count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn iteration_cap_leaves_remainder_for_next_run() -> anyhow::Result<()> {
    let mut fixture = Fixture::new().await?;
    fixture.config.settings.batch_size = 2;
    fixture.config.settings.max_iterations = 2;
    for value in ["Genou", "Main", "Tête", "Pied", "Genou"] {
        fixture.insert_accident(value).await?;
    }

    let first = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;
    assert_eq!(first.outcome, RunOutcome::IterationCapReached);
    assert_eq!(first.iterations, 2);
    assert_eq!(first.records_processed, 4);
    assert_eq!(fixture.unmapped_count().await?, 1);

    let second = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;
    assert_eq!(second.outcome, RunOutcome::Done);
    assert_eq!(second.iterations, 1);
    assert_eq!(second.records_processed, 1);
    assert_eq!(fixture.unmapped_count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn failing_record_does_not_block_the_batch() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let first = fixture.insert_accident("Genou").await?;
    let poisoned = fixture.insert_accident("mains gauches").await?;
    let last = fixture.insert_accident("Tête").await?;

    sqlx::query(&format!(
        "CREATE TRIGGER reject_poisoned BEFORE UPDATE OF lieu_id ON accidents \
         WHEN NEW.id = {} BEGIN SELECT RAISE(ABORT, 'poisoned record'); END",
        poisoned
    ))
    .execute(fixture.database.pool())
    .await?;

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.records_processed, 2);
    assert_eq!(summary.records_failed, 1);
    assert_eq!(summary.error_counts.get("processing"), Some(&1));
    assert_eq!(
        summary.recent_errors.first().and_then(|e| e.record_id),
        Some(poisoned)
    );

    assert_eq!(
        fixture.mapping_of(first).await?,
        Some(fixture.target_id("Genou").await?)
    );
    assert_eq!(fixture.mapping_of(poisoned).await?, None);
    assert_eq!(
        fixture.mapping_of(last).await?,
        Some(fixture.target_id("Tête").await?)
    );

    // The synonym learned before the failure was rolled back with the record
    assert_eq!(fixture.synonyms_named("mains gauches").await?, 0);

    Ok(())
}

#[tokio::test]
async fn unavailable_backend_degrades_to_direct_matching() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let direct = fixture.insert_accident("Pied").await?;
    let semantic = fixture.insert_accident("genoux").await?;

    let summary = fixture
        .run("lieux", Arc::new(Unavailable::new("connection refused")), None)
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.records_processed, 1);
    assert_eq!(summary.records_failed, 0);
    assert_eq!(summary.matches.direct, 1);
    assert_eq!(summary.matches.missed, 1);
    assert_eq!(
        fixture.mapping_of(direct).await?,
        Some(fixture.target_id("Pied").await?)
    );
    assert_eq!(fixture.mapping_of(semantic).await?, None);

    Ok(())
}

#[tokio::test]
async fn direct_matches_never_reach_the_embedder() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let main_id = fixture.target_id("Main").await?;
    let synonyms = fixture.registry.table("dicosynonymes")?;
    let mut session = fixture.database.session().await?;
    SynonymQueries::insert(
        session.conn(),
        synonyms,
        &NewSynonym {
            target_table: "target".to_string(),
            target_id: main_id,
            name: "paume".to_string(),
            origin_note: None,
        },
    )
    .await?;
    session.commit().await?;

    let canonical = fixture.insert_accident("Genou").await?;
    let alias = fixture.insert_accident("paume").await?;

    let embedder = Arc::new(KeywordEmbedder::default());
    let summary = fixture
        .run("lieux", Arc::clone(&embedder) as Arc<dyn Embedder>, None)
        .await?;

    assert_eq!(summary.matches.direct, 2);
    assert_eq!(summary.matches.ai, 0);
    // Only the four canonical options were embedded
    assert_eq!(embedder.calls(), 4);
    assert_eq!(
        fixture.mapping_of(canonical).await?,
        Some(fixture.target_id("Genou").await?)
    );
    assert_eq!(fixture.mapping_of(alias).await?, Some(main_id));

    Ok(())
}

#[tokio::test]
async fn learned_synonyms_are_reused_and_never_duplicated() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let genou = fixture.target_id("Genou").await?;
    let first = fixture.insert_accident("genoux droit").await?;

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;
    assert_eq!(summary.matches.ai, 1);
    assert_eq!(fixture.mapping_of(first).await?, Some(genou));
    assert_eq!(fixture.synonyms_named("genoux droit").await?, 1);

    let exact = fixture.insert_accident("genoux droit").await?;
    let variant = fixture.insert_accident("  Genoux Droit ").await?;

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;
    assert_eq!(summary.matches.direct, 1);
    assert_eq!(summary.matches.ai, 1);
    assert_eq!(fixture.mapping_of(exact).await?, Some(genou));
    assert_eq!(fixture.mapping_of(variant).await?, Some(genou));
    assert_eq!(fixture.synonyms_named("genoux droit").await?, 1);

    let note = sqlx::query_scalar::<_, Option<String>>(
        "SELECT ai_match_message FROM dicosynonymes WHERE name = 'genoux droit'",
    )
    .fetch_one(fixture.database.pool())
    .await?;
    assert_eq!(note.as_deref(), Some("AI match with confidence 1.0000"));

    Ok(())
}

#[tokio::test]
async fn newline_padded_values_learn_one_synonym() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let genou = fixture.target_id("Genou").await?;
    let first = fixture.insert_accident("genoux\n").await?;
    let second = fixture.insert_accident("genoux\n").await?;

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.records_processed, 2);
    assert_eq!(summary.records_failed, 0);
    assert_eq!(summary.matches.ai, 2);
    assert_eq!(fixture.mapping_of(first).await?, Some(genou));
    assert_eq!(fixture.mapping_of(second).await?, Some(genou));

    let names = sqlx::query_scalar::<_, String>(
        "SELECT name FROM dicosynonymes WHERE table_name = 'target'",
    )
    .fetch_all(fixture.database.pool())
    .await?;
    assert_eq!(names, vec!["genoux".to_string()]);

    Ok(())
}

#[tokio::test]
async fn existing_case_variant_synonyms_do_not_block_a_run() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let genou = fixture.target_id("Genou").await?;
    sqlx::query(
        "INSERT INTO dicosynonymes (table_name_id, table_name, name) VALUES (?, 'target', 'Genoux'), (?, 'target', 'genoux')",
    )
    .bind(genou)
    .bind(genou)
    .execute(fixture.database.pool())
    .await?;
    // Schema setup runs again at the start of every run
    fixture.database.ensure_schema(&fixture.registry).await?;

    let exact = fixture.insert_accident("genoux").await?;
    let variant = fixture.insert_accident("GENOUX ").await?;

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.records_failed, 0);
    assert_eq!(summary.matches.direct, 1);
    assert_eq!(fixture.mapping_of(exact).await?, Some(genou));
    assert_eq!(fixture.mapping_of(variant).await?, Some(genou));
    assert_eq!(fixture.synonyms_named("genoux").await?, 2);

    Ok(())
}

#[tokio::test]
async fn multi_valued_records_write_one_junction_row_per_target() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let both = fixture.insert_accident("genou/Main, Genou").await?;
    let partly_numeric = fixture.insert_accident("123 / Pied").await?;
    let numeric = fixture.insert_accident("123").await?;

    let summary = fixture
        .run("lieux_multi", Arc::new(KeywordEmbedder::default()), None)
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.records_processed, 2);

    let targets = |accident_id: i64| {
        sqlx::query_scalar::<_, i64>(
            "SELECT lieu_id FROM accident_lieux WHERE accident_id = ? ORDER BY lieu_id",
        )
        .bind(accident_id)
        .fetch_all(fixture.database.pool())
    };

    let mut expected = vec![
        fixture.target_id("Genou").await?,
        fixture.target_id("Main").await?,
    ];
    expected.sort_unstable();
    assert_eq!(targets(both).await?, expected);
    assert_eq!(
        targets(partly_numeric).await?,
        vec![fixture.target_id("Pied").await?]
    );
    assert!(targets(numeric).await?.is_empty());

    // Single-valued mapping column is untouched
    assert_eq!(fixture.unmapped_count().await?, 3);

    Ok(())
}

#[tokio::test]
async fn caller_threshold_overrides_configured_threshold() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let record = fixture.insert_accident("genou main pied").await?;

    // Equal similarity to three options, each below the default threshold
    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;
    assert_eq!(summary.matches.missed, 1);
    assert_eq!(fixture.mapping_of(record).await?, None);

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), Some(0.5))
        .await?;
    assert_eq!(summary.matches.ai, 1);
    // Ties resolve to the earliest canonical option
    assert_eq!(
        fixture.mapping_of(record).await?,
        Some(fixture.target_id("Genou").await?)
    );

    Ok(())
}

#[tokio::test]
async fn summary_is_produced_when_initialization_fails() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    fixture.insert_accident("Genou").await?;
    sqlx::query("DROP TABLE accident_lieux")
        .execute(fixture.database.pool())
        .await?;
    sqlx::query("DROP TABLE lieux")
        .execute(fixture.database.pool())
        .await?;

    let summary = fixture
        .run("lieux", Arc::new(KeywordEmbedder::default()), None)
        .await?;

    assert!(matches!(summary.outcome, RunOutcome::Failed { .. }));
    assert_eq!(summary.iterations, 0);
    assert_eq!(summary.records_processed, 0);
    assert!(summary.to_string().contains("Outcome: failed"));

    Ok(())
}

#[tokio::test]
async fn record_outcomes_with_disabled_index() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let direct = fixture.insert_accident("Main").await?;
    let miss = fixture.insert_accident("mains").await?;

    let plan = EtlPlan::resolve(&fixture.config, &fixture.registry, "lieux")?;
    let mut monitor = RunMonitor::start("lieux");
    let runner = EtlRunner::initialize(
        &fixture.database,
        plan,
        Arc::new(Unavailable::new("offline")),
        TextNormalizer::default(),
        &RetryPolicy::none(),
        &mut monitor,
    )
    .await?;

    assert_eq!(runner.plan().etl_type, "lieux");
    assert!(!runner.semantic().is_enabled());
    assert!(runner.semantic().disabled_reason().is_some());

    let main_id = fixture.target_id("Main").await?;
    assert_eq!(
        runner.process_record(direct, &mut monitor).await,
        RecordOutcome::Mapped(vec![main_id])
    );
    assert_eq!(
        runner.process_record(miss, &mut monitor).await,
        RecordOutcome::Unmatched
    );
    // Already mapped records are left alone
    assert_eq!(
        runner.process_record(direct, &mut monitor).await,
        RecordOutcome::Skipped
    );

    let metrics = monitor.metrics();
    assert_eq!(metrics.records_processed, 1);
    assert_eq!(metrics.matches.direct, 1);
    assert_eq!(metrics.matches.missed, 1);
    assert!(metrics.timing_stats("load_options").is_some());

    Ok(())
}
