use anyhow::Result;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::database::queries::{SynonymQueries, TargetQueries};
use crate::schema::TableDescriptor;

/// How a deterministic lookup resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectHit {
    Canonical(i64),
    Synonym(i64),
}

impl DirectHit {
    #[inline]
    pub fn target_id(self) -> i64 {
        match self {
            Self::Canonical(id) | Self::Synonym(id) => id,
        }
    }
}

/// Exact canonical-name lookup, then exact synonym lookup scoped by the target table key.
#[derive(Debug, Clone)]
pub struct DeterministicMatcher {
    target: TableDescriptor,
    synonyms: Option<TableDescriptor>,
}

impl DeterministicMatcher {
    pub fn new(target: TableDescriptor, synonyms: Option<TableDescriptor>) -> Self {
        Self { target, synonyms }
    }

    /// Scope under which synonyms of this target are stored
    #[inline]
    pub fn scope(&self) -> &str {
        &self.target.key
    }

    /// Values are compared as given: case-sensitive, untrimmed.
    pub async fn find_direct(
        &self,
        conn: &mut SqliteConnection,
        value: &str,
    ) -> Result<Option<DirectHit>> {
        if let Some(id) = TargetQueries::find_id_by_name(conn, &self.target, value).await? {
            debug!("Direct match for '{}' in {}: {}", value, self.target.name, id);
            return Ok(Some(DirectHit::Canonical(id)));
        }

        let Some(synonyms) = &self.synonyms else {
            return Ok(None);
        };

        let hit = SynonymQueries::find_exact(conn, synonyms, self.scope(), value)
            .await?
            .map(|synonym| {
                debug!(
                    "Synonym match for '{}' in {}: {}",
                    value, synonyms.name, synonym.target_id
                );
                DirectHit::Synonym(synonym.target_id)
            });

        Ok(hit)
    }
}
