// Embeddings module
// Sentence-embedding backends used to vectorize canonical options and query values

pub mod ollama;

pub use ollama::{ModelInfo, OllamaClient};

/// A blocking sentence-embedding backend. One vector per input text.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embeds every text in order. The default implementation calls `embed` per text.
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Stand-in for a backend that failed its startup checks. Every call fails,
/// so the semantic index comes up disabled and only deterministic matching runs.
#[derive(Debug, Clone)]
pub struct Unavailable {
    reason: String,
}

impl Unavailable {
    #[inline]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Embedder for Unavailable {
    fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Err(anyhow::anyhow!("Embedding backend unavailable: {}", self.reason))
    }
}
