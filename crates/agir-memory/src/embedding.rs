use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use agir_store::Store;

/// Vectors for a batch of texts, in input order.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
}

/// Offline embeddings built by hashing word tokens into signed buckets.
/// Texts that share words land close together, which is enough for
/// lexical recall without a network dependency.
#[derive(Clone)]
pub struct HashingEmbeddingProvider {
    dims: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dims];
        for token in tokenize(text) {
            let hash = Sha256::digest(token.as_bytes());
            let bucket =
                u64::from_le_bytes([hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7]])
                    as usize
                    % self.dims;
            let sign = if hash[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| t.to_lowercase())
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts.iter().map(|text| self.embed_one(text)).collect();

        Ok(EmbeddingResult {
            embeddings,
            model: "hashing".to_string(),
            dimensions: self.dims,
        })
    }

    fn model_id(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Texts per request. A cold index build embeds every memory a user has.
const REQUEST_BATCH: usize = 64;

/// `/embeddings` client for OpenAI-compatible servers.
#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingsReply {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut body = serde_json::json!({ "model": self.model, "input": batch });
        // only the v3 models can shorten their output
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = self.dimensions.into();
        }

        let reply: EmbeddingsReply = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        slot_rows(reply.data, batch.len(), self.dimensions)
    }
}

/// Places rows by their `index` field; servers may answer out of order.
fn slot_rows(rows: Vec<EmbeddingRow>, expected: usize, dimensions: usize) -> Result<Vec<Vec<f32>>> {
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for row in rows {
        if row.embedding.len() != dimensions {
            return Err(anyhow!(
                "embedding {} has {} dimensions, configured {dimensions}",
                row.index,
                row.embedding.len()
            ));
        }
        let slot = slots
            .get_mut(row.index)
            .ok_or_else(|| anyhow!("embedding index {} out of range", row.index))?;
        if slot.is_some() {
            return Err(anyhow!("embedding index {} returned twice", row.index));
        }
        *slot = Some(row.embedding);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| slot.ok_or_else(|| anyhow!("no embedding returned for input {i}")))
        .collect()
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(REQUEST_BATCH) {
            embeddings.extend(self.embed_batch(batch).await?);
        }
        Ok(EmbeddingResult {
            embeddings,
            model: self.model.clone(),
            dimensions: self.dimensions,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Wraps a remote provider so memory texts are embedded once per
/// namespace; index rebuilds after invalidation then cost no requests.
pub struct PersistentEmbeddingProvider<P> {
    inner: P,
    store: Store,
    namespace: String,
}

impl<P: EmbeddingProvider> PersistentEmbeddingProvider<P> {
    /// `label` distinguishes endpoints serving the same model name.
    pub fn new(inner: P, store: Store, label: &str) -> Self {
        let namespace = format!("{label}:{}:{}", inner.model_id(), inner.dimensions());
        Self {
            inner,
            store,
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn text_key(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[async_trait]
impl<P: EmbeddingProvider + 'static> EmbeddingProvider for PersistentEmbeddingProvider<P> {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let dims = self.inner.dimensions();
        let keys: Vec<String> = texts.iter().map(|t| text_key(t)).collect();

        let mut known = match self.store.cached_embeddings(&self.namespace, keys.clone()).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, "embedding cache read failed: {e}");
                HashMap::new()
            }
        };
        known.retain(|_, v| v.len() == dims);

        // repeated texts are embedded once
        let mut missing: Vec<(String, String)> = Vec::new();
        for (key, text) in keys.iter().zip(texts) {
            if !known.contains_key(key) && !missing.iter().any(|(k, _)| k == key) {
                missing.push((key.clone(), text.clone()));
            }
        }

        if !missing.is_empty() {
            let inputs: Vec<String> = missing.iter().map(|(_, text)| text.clone()).collect();
            let fresh = self.inner.embed(&inputs).await?.embeddings;
            if fresh.len() != missing.len() {
                return Err(anyhow!(
                    "embedding provider returned {} vectors for {} texts",
                    fresh.len(),
                    missing.len()
                ));
            }
            let entries: Vec<(String, Vec<f32>)> = missing
                .into_iter()
                .map(|(key, _)| key)
                .zip(fresh)
                .collect();
            known.extend(entries.iter().cloned());
            if let Err(e) = self.store.cache_embeddings(&self.namespace, entries).await {
                tracing::warn!(namespace = %self.namespace, "embedding cache write failed: {e}");
            }
        }

        let embeddings = keys
            .iter()
            .map(|key| {
                known
                    .get(key)
                    .cloned()
                    .ok_or_else(|| anyhow!("no embedding for cached text {key}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EmbeddingResult {
            embeddings,
            model: self.inner.model_id().to_string(),
            dimensions: dims,
        })
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}
