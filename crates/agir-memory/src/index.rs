use std::cmp::Ordering;

use agir_schema::Memory;
use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

/// In-memory nearest-neighbour index over one user's memories.
///
/// Search is an exact cosine scan. Per-user memory sets are small enough
/// that the scan is cheaper than maintaining an approximate structure, and
/// results are deterministic.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: String,
    dimensions: usize,
    entries: Vec<(Memory, Vec<f32>)>,
}

impl VectorIndex {
    pub fn build(
        model: impl Into<String>,
        dimensions: usize,
        memories: Vec<Memory>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if memories.len() != embeddings.len() {
            return Err(anyhow!(
                "index build mismatch: {} memories, {} embeddings",
                memories.len(),
                embeddings.len()
            ));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimensions) {
            return Err(anyhow!(
                "index build mismatch: expected {dimensions} dimensions, got {}",
                bad.len()
            ));
        }

        Ok(Self {
            model: model.into(),
            dimensions,
            entries: memories.into_iter().zip(embeddings).collect(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `k` memories by similarity. Equal scores prefer higher importance,
    /// then more recent memories. Zero-similarity entries are never returned.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredMemory> {
        if k == 0 || query.len() != self.dimensions {
            return Vec::new();
        }

        let mut scored: Vec<ScoredMemory> = self
            .entries
            .iter()
            .filter_map(|(memory, embedding)| {
                let score = cosine_similarity(query, embedding);
                (score > 0.0).then(|| ScoredMemory {
                    memory: memory.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    b.memory
                        .importance
                        .partial_cmp(&a.memory.importance)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
        });
        scored.truncate(k);
        scored
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    score.clamp(0.0, 1.0)
}
