//! Matching engine
//!
//! Deterministic lookups (canonical name, then synonym) come first; the
//! context-weighted semantic matcher is the fallback. Accepted semantic
//! matches are learned as synonyms.

pub mod direct;
pub mod index;
pub mod semantic;
pub mod synonym;


pub use direct::{DeterministicMatcher, DirectHit};
pub use index::{EmbeddingIndex, cosine_similarity, top_k};
pub use semantic::{ContextEntry, ContextValue, MatchResult, SemanticMatcher};
pub use synonym::SynonymLearner;

use crate::database::models::CanonicalOption;

/// Position-to-id translation for semantic match results.
///
/// Kept apart from the embedding index: positions address embeddings, ids address rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    ids: Vec<i64>,
}

impl IdMap {
    /// Split canonical options into the position-ordered names to embed and the id map.
    pub fn from_options(options: Vec<CanonicalOption>) -> (Vec<String>, Self) {
        let (ids, names): (Vec<i64>, Vec<String>) =
            options.into_iter().map(|o| (o.id, o.name)).unzip();
        (names, Self { ids })
    }

    #[inline]
    pub fn resolve(&self, position: usize) -> Option<i64> {
        self.ids.get(position).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
