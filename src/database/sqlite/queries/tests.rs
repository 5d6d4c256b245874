use super::*;
use crate::config::{Config, DEFAULT_SYNONYM_TABLE};
use crate::database::Database;
use crate::schema::SchemaRegistry;
use tempfile::TempDir;

const CONFIG: &str = r#"
[tables.source]
name = "accidents"
columns = { id = { type = "int unsigned", primary = true, auto_increment = true }, localisation = { type = "varchar(255)" }, circonstance = { type = "text" }, gravite = { type = "int" }, lieu_id = { type = "int unsigned" } }

[tables.target]
name = "lieux"
columns = { id = { type = "int unsigned", primary = true, auto_increment = true }, name = { type = "varchar(120)" } }

[tables.junction]
name = "accident_lieux"
columns = { id = { type = "int unsigned", primary = true, auto_increment = true }, accident_id = { type = "int unsigned", references = "source.id" }, lieu_id = { type = "int unsigned", references = "target.id" } }

[etl_types.lieux]
source_table = "source"
table_name = "target"
dictionary_table = "dicosynonymes"
value_field = "localisation"
mapping_id_field = "lieu_id"
"#;

async fn create_test_database() -> (TempDir, Database, SchemaRegistry) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = Config::from_toml_str(CONFIG).expect("Failed to parse config");
    let registry = SchemaRegistry::from_config(&config).expect("Failed to build registry");

    let database = Database::new(temp_dir.path().join("test.db"))
        .await
        .expect("Failed to open database");
    database
        .ensure_schema(&registry)
        .await
        .expect("Failed to create schema");

    (temp_dir, database, registry)
}

async fn insert_accident(database: &Database, localisation: Option<&str>, circonstance: &str) -> i64 {
    sqlx::query("INSERT INTO accidents (localisation, circonstance, gravite) VALUES (?, ?, 3)")
        .bind(localisation)
        .bind(circonstance)
        .execute(database.pool())
        .await
        .expect("Failed to insert accident")
        .last_insert_rowid()
}

fn single_select() -> SourceSelect {
    SourceSelect {
        table_name: "accidents".to_string(),
        value_field: "localisation".to_string(),
        context_fields: vec!["circonstance".to_string(), "gravite".to_string()],
        pending: PendingFilter::NullMappingId {
            mapping_id_field: "lieu_id".to_string(),
        },
    }
}

#[tokio::test]
async fn target_lookup_is_case_sensitive() {
    let (_temp_dir, database, registry) = create_test_database().await;
    let target = registry.table("target").expect("target registered");
    let mut session = database.session().await.expect("session");

    let id = TargetQueries::insert(session.conn(), target, "Genou")
        .await
        .expect("insert");

    assert_eq!(
        TargetQueries::find_id_by_name(session.conn(), target, "Genou")
            .await
            .expect("lookup"),
        Some(id)
    );
    assert_eq!(
        TargetQueries::find_id_by_name(session.conn(), target, "genou")
            .await
            .expect("lookup"),
        None
    );
    assert_eq!(
        TargetQueries::find_id_by_name(session.conn(), target, " Genou")
            .await
            .expect("lookup"),
        None
    );
}

#[tokio::test]
async fn list_options_ordered_by_id() {
    let (_temp_dir, database, registry) = create_test_database().await;
    let target = registry.table("target").expect("target registered");
    let mut session = database.session().await.expect("session");

    for name in ["Main", "Genou", "Dos"] {
        TargetQueries::insert(session.conn(), target, name)
            .await
            .expect("insert");
    }

    let options = TargetQueries::list_options(session.conn(), target)
        .await
        .expect("list");
    let names: Vec<&str> = options.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["Main", "Genou", "Dos"]);
    assert!(options.windows(2).all(|w| w[0].id < w[1].id));
}

#[tokio::test]
async fn synonym_lookups_and_uniqueness() {
    let (_temp_dir, database, registry) = create_test_database().await;
    let synonyms = registry.table(DEFAULT_SYNONYM_TABLE).expect("synonyms registered");
    let mut session = database.session().await.expect("session");

    let created = SynonymQueries::insert(
        session.conn(),
        synonyms,
        &NewSynonym::from_semantic_match("target", 4, "Cheville G", 0.81),
    )
    .await
    .expect("insert");
    assert_eq!(created.target_id, 4);

    let exact = SynonymQueries::find_exact(session.conn(), synonyms, "target", "Cheville G")
        .await
        .expect("lookup");
    assert_eq!(exact.map(|s| s.id), Some(created.id));

    // Exact lookup never normalizes
    assert!(
        SynonymQueries::find_exact(session.conn(), synonyms, "target", "cheville g")
            .await
            .expect("lookup")
            .is_none()
    );
    // Scoped by target table key
    assert!(
        SynonymQueries::find_exact(session.conn(), synonyms, "other", "Cheville G")
            .await
            .expect("lookup")
            .is_none()
    );

    let normalized =
        SynonymQueries::find_normalized(session.conn(), synonyms, "target", "  CHEVILLE g ")
            .await
            .expect("lookup");
    assert_eq!(normalized.map(|s| s.id), Some(created.id));

    // Tabs and newlines are trimmed too
    let padded = SynonymQueries::find_normalized(session.conn(), synonyms, "target", "cheville g\t\n")
        .await
        .expect("lookup");
    assert_eq!(padded.map(|s| s.id), Some(created.id));

    assert!(
        SynonymQueries::find_normalized(session.conn(), synonyms, "other", "Cheville G")
            .await
            .expect("lookup")
            .is_none()
    );

    let listed = SynonymQueries::list_for_scope(session.conn(), synonyms, "target")
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn normalized_lookup_folds_accented_capitals() {
    let (_temp_dir, database, registry) = create_test_database().await;
    let synonyms = registry.table(DEFAULT_SYNONYM_TABLE).expect("synonyms registered");
    let mut session = database.session().await.expect("session");

    let created = SynonymQueries::insert(
        session.conn(),
        synonyms,
        &NewSynonym::from_semantic_match("target", 2, "épaule", 0.8),
    )
    .await
    .expect("insert");

    for variant in ["ÉPAULE", " Épaule", "épaule\r\n"] {
        let found = SynonymQueries::find_normalized(session.conn(), synonyms, "target", variant)
            .await
            .expect("lookup");
        assert_eq!(found.map(|s| s.id), Some(created.id), "variant {variant:?}");
    }
    assert!(
        SynonymQueries::find_normalized(session.conn(), synonyms, "target", "epaule")
            .await
            .expect("lookup")
            .is_none()
    );
}

#[test]
fn synonym_key_trims_unicode_whitespace_and_lowercases() {
    assert_eq!(synonym_key("\tGENOUX\n"), "genoux");
    assert_eq!(synonym_key("\u{a0}Tête "), "tête");
    assert_eq!(synonym_key("ÉPAULE"), synonym_key("épaule"));
}

#[tokio::test]
async fn legacy_dictionary_with_case_variants_passes_schema_setup() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = Config::from_toml_str(CONFIG).expect("Failed to parse config");
    let registry = SchemaRegistry::from_config(&config).expect("Failed to build registry");
    let database = Database::new(temp_dir.path().join("legacy.db"))
        .await
        .expect("Failed to open database");

    sqlx::query(
        "CREATE TABLE dicosynonymes (id INTEGER PRIMARY KEY AUTOINCREMENT, created TEXT, modified TEXT, \
         table_name_id INTEGER NOT NULL, table_name TEXT NOT NULL, name TEXT NOT NULL, ai_match_message TEXT)",
    )
    .execute(database.pool())
    .await
    .expect("Failed to create legacy dictionary");
    sqlx::query(
        "INSERT INTO dicosynonymes (table_name_id, table_name, name) VALUES (1, 'target', 'Genou'), (1, 'target', 'genou')",
    )
    .execute(database.pool())
    .await
    .expect("Failed to seed legacy dictionary");

    database
        .ensure_schema(&registry)
        .await
        .expect("schema setup tolerates existing duplicates");

    let synonyms = registry.table(DEFAULT_SYNONYM_TABLE).expect("synonyms registered");
    let mut session = database.session().await.expect("session");
    let first = SynonymQueries::find_normalized(session.conn(), synonyms, "target", "GENOU")
        .await
        .expect("lookup");
    assert_eq!(first.map(|s| s.name), Some("Genou".to_string()));
}

#[tokio::test]
async fn fetch_unmapped_uses_keyset_cursor() {
    let (_temp_dir, database, _registry) = create_test_database().await;
    let first = insert_accident(&database, Some("genou"), "chute").await;
    let _null_value = insert_accident(&database, None, "chute").await;
    let third = insert_accident(&database, Some("main"), "coupure").await;

    let select = single_select();
    let mut session = database.session().await.expect("session");

    let batch = SourceQueries::fetch_unmapped(session.conn(), &select, None, 10)
        .await
        .expect("fetch");
    let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first, third]);
    assert_eq!(batch[0].value.as_deref(), Some("genou"));
    assert_eq!(batch[0].context_value("circonstance"), Some("chute"));
    // Non-text context columns are rendered as text
    assert_eq!(batch[0].context_value("gravite"), Some("3"));

    let after = SourceQueries::fetch_unmapped(session.conn(), &select, Some(first), 10)
        .await
        .expect("fetch");
    assert_eq!(after.iter().map(|r| r.id).collect::<Vec<_>>(), vec![third]);

    let limited = SourceQueries::fetch_unmapped(session.conn(), &select, None, 1)
        .await
        .expect("fetch");
    assert_eq!(limited.len(), 1);

    assert_eq!(
        SourceQueries::count_unmapped(session.conn(), &select)
            .await
            .expect("count"),
        2
    );
}

#[tokio::test]
async fn set_mapping_id_removes_row_from_pending() {
    let (_temp_dir, database, registry) = create_test_database().await;
    let target = registry.table("target").expect("target registered");
    let record_id = insert_accident(&database, Some("genou"), "chute").await;
    let select = single_select();

    let mut session = database.session().await.expect("session");
    let target_id = TargetQueries::insert(session.conn(), target, "Genou")
        .await
        .expect("insert");
    SourceQueries::set_mapping_id(session.conn(), "accidents", "lieu_id", record_id, target_id)
        .await
        .expect("update");

    assert!(
        SourceQueries::reload_unmapped(session.conn(), &select, record_id)
            .await
            .expect("reload")
            .is_none()
    );
    assert!(
        SourceQueries::set_mapping_id(session.conn(), "accidents", "lieu_id", 9999, target_id)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn junction_rows_mark_record_as_mapped() {
    let (_temp_dir, database, registry) = create_test_database().await;
    let target = registry.table("target").expect("target registered");
    let record_id = insert_accident(&database, Some("genou/main"), "chute").await;
    let select = SourceSelect {
        pending: PendingFilter::NoJunctionRow {
            junction_table: "accident_lieux".to_string(),
            source_field: "accident_id".to_string(),
        },
        ..single_select()
    };

    let mut session = database.session().await.expect("session");
    assert!(
        SourceQueries::reload_unmapped(session.conn(), &select, record_id)
            .await
            .expect("reload")
            .is_some()
    );

    let genou = TargetQueries::insert(session.conn(), target, "Genou")
        .await
        .expect("insert");
    let main = TargetQueries::insert(session.conn(), target, "Main")
        .await
        .expect("insert");
    for target_id in [genou, main] {
        JunctionQueries::insert(
            session.conn(),
            "accident_lieux",
            "accident_id",
            "lieu_id",
            record_id,
            target_id,
        )
        .await
        .expect("link");
    }

    assert_eq!(
        JunctionQueries::targets_for(
            session.conn(),
            "accident_lieux",
            "accident_id",
            "lieu_id",
            record_id
        )
        .await
        .expect("targets"),
        vec![genou, main]
    );
    assert!(
        SourceQueries::fetch_unmapped(session.conn(), &select, None, 10)
            .await
            .expect("fetch")
            .is_empty()
    );
}
