use anyhow::Result;
use tracing::{debug, info, warn};

use crate::embeddings::Embedder;

/// Dense, position-addressed embeddings of the canonical options.
///
/// Positions follow the order of the texts the index was built from. The index
/// knows nothing about database ids; callers keep their own position-to-id map.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingIndex {
    state: IndexState,
}

#[derive(Debug, Clone, PartialEq)]
enum IndexState {
    Ready {
        embeddings: Vec<Vec<f32>>,
        norms: Vec<f32>,
    },
    Disabled {
        reason: String,
    },
}

impl EmbeddingIndex {
    /// Embed every text. Backend failures or malformed output disable the index
    /// instead of failing.
    pub fn build(embedder: &dyn Embedder, texts: &[String]) -> Self {
        if texts.is_empty() {
            info!("Building embedding index with no canonical options");
            return Self::from_embeddings(Vec::new());
        }

        info!("Computing embeddings for {} canonical options", texts.len());
        let embeddings = match embedder.embed_batch(texts) {
            Ok(embeddings) => embeddings,
            Err(e) => return Self::disabled(format!("embedding backend failed: {:#}", e)),
        };

        if embeddings.len() != texts.len() {
            return Self::disabled(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            ));
        }

        Self::from_embeddings(embeddings)
    }

    /// Wrap precomputed embeddings; rows must share one non-zero dimension.
    pub fn from_embeddings(embeddings: Vec<Vec<f32>>) -> Self {
        let Some(dimension) = embeddings.first().map(Vec::len) else {
            return Self {
                state: IndexState::Ready {
                    embeddings,
                    norms: Vec::new(),
                },
            };
        };

        if dimension == 0 {
            return Self::disabled("embeddings have zero dimensions".to_string());
        }
        if let Some(position) = embeddings.iter().position(|e| e.len() != dimension) {
            return Self::disabled(format!(
                "embedding {} has {} dimensions, expected {}",
                position,
                embeddings[position].len(),
                dimension
            ));
        }

        let norms = embeddings.iter().map(|e| norm(e)).collect();
        debug!(
            "Embedding index ready: {} rows of dimension {}",
            embeddings.len(),
            dimension
        );
        Self {
            state: IndexState::Ready { embeddings, norms },
        }
    }

    pub fn disabled(reason: String) -> Self {
        warn!("Embedding index disabled: {}", reason);
        Self {
            state: IndexState::Disabled { reason },
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        matches!(self.state, IndexState::Ready { .. })
    }

    #[inline]
    pub fn disabled_reason(&self) -> Option<&str> {
        match &self.state {
            IndexState::Disabled { reason } => Some(reason),
            IndexState::Ready { .. } => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match &self.state {
            IndexState::Ready { embeddings, .. } => embeddings.len(),
            IndexState::Disabled { .. } => 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> Option<usize> {
        match &self.state {
            IndexState::Ready { embeddings, .. } => embeddings.first().map(Vec::len),
            IndexState::Disabled { .. } => None,
        }
    }

    /// Cosine similarity of `query` against every row, in position order.
    /// Empty for a disabled or empty index.
    pub fn similarities(&self, query: &[f32]) -> Result<Vec<f32>> {
        let IndexState::Ready { embeddings, norms } = &self.state else {
            return Ok(Vec::new());
        };

        match self.dimension() {
            Some(dimension) if dimension != query.len() => {
                return Err(anyhow::anyhow!(
                    "query has {} dimensions, index has {}",
                    query.len(),
                    dimension
                ));
            }
            _ => {}
        }

        let query_norm = norm(query);
        Ok(embeddings
            .iter()
            .zip(norms)
            .map(|(row, row_norm)| cosine_with_norms(query, query_norm, row, *row_norm))
            .collect())
    }
}

/// Highest `k` scores, best first. Equal scores keep the lower position first
/// and NaN scores rank last. `k` larger than the number of scores returns them all.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| {
        a.1.is_nan()
            .cmp(&b.1.is_nan())
            .then_with(|| b.1.total_cmp(&a.1))
    });
    ranked.truncate(k.min(scores.len()));
    ranked
}

/// Cosine similarity in [-1, 1]; zero when either vector has zero length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_with_norms(a, norm(a), b, norm(b))
}

fn cosine_with_norms(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

#[inline]
fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}
