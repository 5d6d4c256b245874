use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::index::{EmbeddingIndex, top_k};
use crate::embeddings::Embedder;
use crate::text::{TextNormalizer, normalize_text};

/// Number of ranked candidates reported for diagnostics
pub const DIAGNOSTIC_CANDIDATES: usize = 3;

/// A context value attached to a query.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    /// Folded into the query text only
    Plain(String),
    /// Folded into the query text and re-scored with its relative weight
    Weighted { value: String, weight: f32 },
}

impl ContextValue {
    #[inline]
    pub fn text(&self) -> &str {
        match self {
            Self::Plain(value) | Self::Weighted { value, .. } => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub field: String,
    pub value: ContextValue,
}

impl ContextEntry {
    pub fn plain(field: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            value: ContextValue::Plain(value.to_string()),
        }
    }

    pub fn weighted(field: &str, value: &str, weight: f32) -> Self {
        Self {
            field: field.to_string(),
            value: ContextValue::Weighted {
                value: value.to_string(),
                weight,
            },
        }
    }
}

/// Accepted semantic match. `matched_index` is a position in the option list, not a database id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched_index: usize,
    pub confidence: f32,
    pub matched_text: String,
}

/// Context-aware nearest-neighbor matching over a fixed set of canonical option names.
///
/// Built once per run. Options and embeddings never change afterwards, so a
/// matcher can be shared read-only.
pub struct SemanticMatcher {
    embedder: Arc<dyn Embedder>,
    index: EmbeddingIndex,
    option_names: Vec<String>,
    normalizer: TextNormalizer,
    default_threshold: f32,
}

impl fmt::Debug for SemanticMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemanticMatcher")
            .field("options", &self.option_names.len())
            .field("enabled", &self.index.is_enabled())
            .field("default_threshold", &self.default_threshold)
            .finish_non_exhaustive()
    }
}

impl SemanticMatcher {
    /// Embeds the normalized form of every option name, in order.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        option_names: Vec<String>,
        normalizer: TextNormalizer,
        default_threshold: f32,
    ) -> Self {
        let normalized: Vec<String> = option_names
            .iter()
            .map(|name| normalizer.normalize_term(name))
            .collect();
        let index = EmbeddingIndex::build(embedder.as_ref(), &normalized);

        Self::with_index(embedder, index, option_names, normalizer, default_threshold)
    }

    /// Assemble from a prebuilt index, which must have one row per option when enabled.
    pub fn with_index(
        embedder: Arc<dyn Embedder>,
        index: EmbeddingIndex,
        option_names: Vec<String>,
        normalizer: TextNormalizer,
        default_threshold: f32,
    ) -> Self {
        let index = if index.is_enabled() && index.len() != option_names.len() {
            EmbeddingIndex::disabled(format!(
                "index has {} rows for {} options",
                index.len(),
                option_names.len()
            ))
        } else {
            index
        };

        Self {
            embedder,
            index,
            option_names,
            normalizer,
            default_threshold,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.index.is_enabled()
    }

    /// Why the index is disabled, when it is
    #[inline]
    pub fn disabled_reason(&self) -> Option<&str> {
        self.index.disabled_reason()
    }

    #[inline]
    pub fn default_threshold(&self) -> f32 {
        self.default_threshold
    }

    /// Normalized value followed by each non-empty normalized context value, space separated
    pub fn enhanced_query(&self, value: &str, context: &[ContextEntry]) -> String {
        let mut parts = vec![self.normalizer.normalize_term(value)];

        for entry in context {
            let normalized = normalize_text(entry.value.text());
            if normalized.is_empty() {
                continue;
            }
            debug!("Added context field '{}' with value '{}'", entry.field, normalized);
            parts.push(normalized);
        }

        parts.join(" ")
    }

    /// Base similarity of the enhanced query plus the weighted context boosts.
    /// Boosted scores may exceed 1.0.
    pub fn score(&self, value: &str, context: &[ContextEntry]) -> Result<Vec<f32>> {
        let enhanced = self.enhanced_query(value, context);
        debug!("Enhanced value: '{}'", enhanced);

        let query = self
            .embedder
            .embed(&enhanced)
            .context("Failed to embed query")?;
        let mut scores = self.index.similarities(&query)?;

        let total_weight: f32 = context
            .iter()
            .filter_map(|entry| match &entry.value {
                ContextValue::Weighted { weight, .. } => Some(*weight),
                ContextValue::Plain(_) => None,
            })
            .sum();
        let total_weight = if total_weight > 0.0 { total_weight } else { 1.0 };

        for entry in context {
            let ContextValue::Weighted { value, weight } = &entry.value else {
                continue;
            };
            if value.is_empty() {
                continue;
            }

            let normalized_weight = weight / total_weight;
            let embedding = self
                .embedder
                .embed(value)
                .with_context(|| format!("Failed to embed context field '{}'", entry.field))?;
            let boosts = self.index.similarities(&embedding)?;

            for (score, boost) in scores.iter_mut().zip(boosts) {
                *score += boost * normalized_weight;
            }
            debug!(
                "Applied weight {} to context field '{}'",
                normalized_weight, entry.field
            );
        }

        Ok(scores)
    }

    /// Up to three best-scoring options, best first. Diagnostic only.
    pub fn rank_candidates(&self, value: &str, context: &[ContextEntry]) -> Result<Vec<(usize, f32)>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        Ok(top_k(&self.score(value, context)?, DIAGNOSTIC_CANDIDATES))
    }

    /// Best option whose score reaches the threshold (`>=`), or `None`.
    ///
    /// The threshold is the caller's when given, else the matcher default. A
    /// disabled index, an empty option set and backend errors all yield `None`.
    pub fn find_best_match(
        &self,
        value: &str,
        context: &[ContextEntry],
        threshold: Option<f32>,
    ) -> Option<MatchResult> {
        if !self.is_enabled() {
            debug!("Semantic matching skipped for '{}': index disabled", value);
            return None;
        }
        if self.option_names.is_empty() {
            debug!("Semantic matching skipped for '{}': no canonical options", value);
            return None;
        }

        let threshold = threshold.unwrap_or(self.default_threshold);
        debug!("Finding best match for: '{}'", value);

        let candidates = match self.rank_candidates(value, context) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Error in semantic matching for '{}': {:#}", value, e);
                return None;
            }
        };

        for (position, score) in &candidates {
            debug!(
                "  - '{}' (similarity: {:.4})",
                self.option_names[*position], score
            );
        }

        let (best_index, best_score) = *candidates.first()?;
        let matched_text = self.option_names.get(best_index)?.clone();

        if best_score >= threshold {
            info!(
                "Match found for '{}': '{}' (similarity: {:.4})",
                value, matched_text, best_score
            );
            Some(MatchResult {
                matched_index: best_index,
                confidence: best_score,
                matched_text,
            })
        } else {
            debug!(
                "No match for '{}' above threshold ({}). Best similarity: {:.4}",
                value, threshold, best_score
            );
            None
        }
    }
}
