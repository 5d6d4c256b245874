
use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::retry::RetryPolicy;

/// Blocking client for an Ollama server's `/api/embed` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    model: String,
    batch_size: usize,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

/// How a failed HTTP attempt is handled
enum Failure {
    Transient(String),
    Permanent(String),
}

impl From<ureq::Error> for Failure {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::StatusCode(status) if status >= 500 => {
                Self::Transient(format!("server error: HTTP {}", status))
            }
            ureq::Error::StatusCode(status) => Self::Permanent(format!("client error: HTTP {}", status)),
            ureq::Error::ConnectionFailed
            | ureq::Error::HostNotFound
            | ureq::Error::Timeout(_)
            | ureq::Error::Io(_) => Self::Transient(format!("transport error: {}", error)),
            other => Self::Permanent(other.to_string()),
        }
    }
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config
            .base_url()
            .context("Invalid embedding backend address")?;

        Ok(Self {
            base_url,
            model: config.model.clone(),
            batch_size: config.batch_size.max(1) as usize,
            agent: build_agent(config.timeout()),
            retry: RetryPolicy::default(),
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Fails unless the server answers and the configured model is pulled.
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        let models = self
            .list_models()
            .with_context(|| format!("Embedding backend at {} is unreachable", self.base_url))?;

        if models.iter().all(|m| m.name != self.model) {
            let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
            warn!("Embedding model {} is not pulled on {}", self.model, self.base_url);
            return Err(anyhow!(
                "Model '{}' is not available (found: {})",
                self.model,
                available.join(", ")
            ));
        }

        info!("Embedding backend ready: {} ({})", self.base_url, self.model);
        Ok(())
    }

    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        let tags: TagsResponse = self.call_json("list models", || {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        debug!("{} models available on {}", tags.models.len(), self.base_url);
        Ok(tags.models)
    }

    /// One `/api/embed` round trip; the server must return one vector per input.
    fn embed_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint("/api/embed")?;
        let body = serde_json::to_string(&EmbedRequest {
            model: &self.model,
            input: texts,
        })
        .context("Failed to encode embedding request")?;

        let response: EmbedResponse = self.call_json("embed", || {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        if response.embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Embedding backend returned {} vectors for {} inputs",
                response.embeddings.len(),
                texts.len()
            ));
        }

        Ok(response.embeddings)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Failed to build URL for {}", path))
    }

    /// Run `send` under the retry policy and decode the JSON body. Server and
    /// transport errors are retried; client errors fail immediately.
    fn call_json<T, F>(&self, label: &str, mut send: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> Result<String, ureq::Error>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        let body = loop {
            match send().map_err(Failure::from) {
                Ok(body) => break body,
                Err(Failure::Permanent(reason)) => {
                    warn!("Embedding backend {} failed: {}", label, reason);
                    return Err(anyhow!("Embedding backend {} failed: {}", label, reason));
                }
                Err(Failure::Transient(reason)) if attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Embedding backend {} failed ({}), attempt {}/{}. Retrying in {:?}",
                        label, reason, attempt, max_attempts, delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(Failure::Transient(reason)) => {
                    error!(
                        "Embedding backend {} failed after {} attempts: {}",
                        label, attempt, reason
                    );
                    return Err(anyhow!(
                        "Embedding backend {} failed after {} attempts: {}",
                        label,
                        attempt,
                        reason
                    ));
                }
            }
        };

        serde_json::from_str(&body).with_context(|| format!("Malformed {} response", label))
    }
}

impl Embedder for OllamaClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_request(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow!("Embedding backend returned no vector"))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            debug!("Embedding batch {} ({} texts)", i + 1, batch.len());
            vectors.extend(
                self.embed_request(batch)
                    .with_context(|| format!("Failed to embed batch {}", i + 1))?,
            );
        }
        Ok(vectors)
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}
