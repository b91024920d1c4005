//! Batch embedding providers.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHasher;
use serde::Deserialize;
use tracing::instrument;

use crate::errors::{PipelineError, Result};
use crate::ratelimit::{AdaptiveLimiter, Outcome};
use crate::settings::Settings;

/// A provider that turns an ordered list of strings into one vector per
/// input, in the same order. Implementations must treat a count or order
/// mismatch as their own error, never silently pad.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier persisted alongside each vector.
    fn model(&self) -> &str;

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// HTTP provider speaking the common `{"model": .., "input": [..]}` batch
/// shape. Calls are paced through the shared limiter like every other
/// outbound request.
pub struct HttpEmbeddingProvider {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    limiter: Arc<AdaptiveLimiter>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(settings: &Settings, limiter: Arc<AdaptiveLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()?;
        Ok(Self {
            http,
            url: settings.embeddings_url.clone(),
            api_key: settings.embeddings_api_key.clone(),
            model: settings.embedding_model.clone(),
            limiter,
        })
    }

    async fn embed_batch_once(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": inputs,
            }))
            .send()
            .await?;

        let status = response.status().as_u16();
        match Outcome::from_status(status) {
            Outcome::Success => {}
            Outcome::RateLimited => return Err(PipelineError::RateLimited { status }),
            Outcome::Forbidden => return Err(PipelineError::Forbidden { status }),
            Outcome::ServerError => return Err(PipelineError::Server { status }),
            Outcome::NotFound | Outcome::Other => {
                return Err(PipelineError::Provider(format!(
                    "unexpected provider status {status}"
                )));
            }
        }

        let body: EmbeddingResponse = response.json().await?;
        if body.data.len() != inputs.len() {
            return Err(PipelineError::Provider(format!(
                "provider returned {} vectors for {} inputs",
                body.data.len(),
                inputs.len()
            )));
        }
        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, inputs), fields(batch = inputs.len()))]
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        self.limiter.acquire_slot().await;
        let result = self.embed_batch_once(inputs).await;
        self.limiter
            .report_outcome(Outcome::from_result(&result))
            .await;
        result
    }
}

/// Deterministic offline provider: the vector is a pure function of the
/// input text. Used by tests and the end-to-end scenario harness.
pub struct MockEmbeddingProvider {
    dim: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        let mut state = hasher.finish() | 1;
        let mut values = Vec::with_capacity(self.dim);
        for _ in 0..self.dim {
            // xorshift64*, mapped into [-1, 1]
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let mixed = state.wrapping_mul(0x2545_f491_4f6c_dd1d);
            values.push((mixed as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32);
        }
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
        values.iter().map(|v| v / norm).collect()
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(1536)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn model(&self) -> &str {
        "mock-deterministic"
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| self.vector_for(text)).collect())
    }
}
