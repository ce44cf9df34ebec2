//! Memory retrieval: embeddings, per-user vector indexes behind a bounded
//! LRU cache, and the memory-augmented completion pipeline.

pub mod cache;
pub mod completion;
pub mod embedding;
pub mod index;

pub use cache::{CacheStats, RetrievalCache, RetrievalOptions};
pub use completion::{Completion, CompletionRequest, CompletionService, Usage};
pub use embedding::{
    EmbeddingProvider, EmbeddingResult, HashingEmbeddingProvider, OpenAiEmbeddingProvider,
    PersistentEmbeddingProvider,
};
pub use index::{cosine_similarity, ScoredMemory, VectorIndex};
