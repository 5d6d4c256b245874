#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};

/// An existing target entity that source values resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalOption {
    pub id: i64,
    pub name: String,
}

/// A learned alias of a canonical option, scoped to a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synonym {
    pub id: i64,
    pub target_table: String,
    pub target_id: i64,
    pub name: String,
    pub origin_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSynonym {
    pub target_table: String,
    pub target_id: i64,
    pub name: String,
    pub origin_note: Option<String>,
}

impl NewSynonym {
    /// Synonym learned from a semantic match; the note records its confidence.
    #[inline]
    pub fn from_semantic_match(
        target_table: &str,
        target_id: i64,
        raw_value: &str,
        confidence: f32,
    ) -> Self {
        Self {
            target_table: target_table.to_string(),
            target_id,
            name: raw_value.trim().to_string(),
            origin_note: Some(format!("AI match with confidence {:.4}", confidence)),
        }
    }
}

/// A source row awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: i64,
    pub value: Option<String>,
    /// Context columns in configured order, rendered as text
    pub context: Vec<(String, Option<String>)>,
}

impl SourceRecord {
    #[inline]
    pub fn context_value(&self, field: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(name, _)| name == field)
            .and_then(|(_, value)| value.as_deref())
    }
}

/// Predicate that marks a source row as still unmapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingFilter {
    /// The mapping id column is NULL
    NullMappingId { mapping_id_field: String },
    /// No junction row references the source row yet
    NoJunctionRow {
        junction_table: String,
        source_field: String,
    },
}

/// Physical shape of the unmapped-record query. Names are validated identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSelect {
    pub table_name: String,
    pub value_field: String,
    pub context_fields: Vec<String>,
    pub pending: PendingFilter,
}
