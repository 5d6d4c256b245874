use super::*;

#[test]
fn semantic_synonym_is_trimmed_and_annotated() {
    let synonym = NewSynonym::from_semantic_match("lieux", 7, "  femur gauche ", 0.912_345);
    assert_eq!(synonym.target_table, "lieux");
    assert_eq!(synonym.target_id, 7);
    assert_eq!(synonym.name, "femur gauche");
    assert_eq!(
        synonym.origin_note.as_deref(),
        Some("AI match with confidence 0.9123")
    );
}

#[test]
fn context_lookup_by_field() {
    let record = SourceRecord {
        id: 1,
        value: Some("genou".to_string()),
        context: vec![
            ("circonstance".to_string(), Some("chute".to_string())),
            ("commentaire".to_string(), None),
        ],
    };

    assert_eq!(record.context_value("circonstance"), Some("chute"));
    assert_eq!(record.context_value("commentaire"), None);
    assert_eq!(record.context_value("absent"), None);
}
