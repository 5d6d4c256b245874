use anyhow::Result;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::database::models::NewSynonym;
use crate::database::queries::SynonymQueries;
use crate::schema::TableDescriptor;

/// Records semantic matches as synonyms so later runs resolve them directly.
#[derive(Debug, Clone)]
pub struct SynonymLearner {
    synonyms: TableDescriptor,
    scope: String,
}

impl SynonymLearner {
    pub fn new(synonyms: TableDescriptor, scope: &str) -> Self {
        Self {
            synonyms,
            scope: scope.to_string(),
        }
    }

    /// Returns `true` when a synonym was created, `false` when one already exists
    /// for the trimmed, lowercased name under this scope. Accented capitals
    /// fold like ASCII ones.
    ///
    /// Runs on the caller's connection so it commits or rolls back with the record.
    pub async fn learn(
        &self,
        conn: &mut SqliteConnection,
        raw_value: &str,
        target_id: i64,
        confidence: f32,
    ) -> Result<bool> {
        let name = raw_value.trim();
        if let Some(existing) =
            SynonymQueries::find_normalized(conn, &self.synonyms, &self.scope, name).await?
        {
            debug!(
                "Synonym '{}' already known for {} as '{}' (-> {})",
                name, self.scope, existing.name, existing.target_id
            );
            return Ok(false);
        }

        let synonym =
            NewSynonym::from_semantic_match(&self.scope, target_id, name, confidence);
        SynonymQueries::insert(conn, &self.synonyms, &synonym).await?;

        info!(
            "Learned synonym '{}' -> {}.{} (confidence {:.4})",
            synonym.name, self.scope, target_id, confidence
        );
        Ok(true)
    }
}
