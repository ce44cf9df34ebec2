use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use agir_schema::{Memory, User};
use agir_store::{MemoryOrder, Store};
use anyhow::{anyhow, Result};
use lru::LruCache;
use serde::Serialize;
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::index::{ScoredMemory, VectorIndex};

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub index_capacity: usize,
    pub profile_capacity: usize,
    /// Queries shorter than this (in characters) return nothing.
    pub min_query_chars: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            index_capacity: 50,
            profile_capacity: 100,
            min_query_chars: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub index_count: usize,
    pub index_capacity: usize,
    pub profile_count: usize,
    pub profile_capacity: usize,
    /// `user_id:embedding_model`, most recently used first.
    pub index_keys: Vec<String>,
    /// User ids, most recently used first.
    pub profile_keys: Vec<String>,
    /// Cold index builds since start.
    pub rebuilds: u64,
}

struct CacheState {
    indexes: LruCache<Uuid, Arc<VectorIndex>>,
    profiles: LruCache<Uuid, User>,
    /// Bumped by every invalidation; a build started under an older epoch is
    /// served to its caller but not cached.
    epoch: u64,
}

/// Bounded per-user vector indexes and user profiles, evicted least-recently-used.
pub struct RetrievalCache {
    store: Store,
    embedder: Arc<dyn EmbeddingProvider>,
    options: RetrievalOptions,
    state: Mutex<CacheState>,
    rebuilds: AtomicU64,
}

impl RetrievalCache {
    pub fn new(
        store: Store,
        embedder: Arc<dyn EmbeddingProvider>,
        options: RetrievalOptions,
    ) -> Result<Self> {
        let index_capacity = NonZeroUsize::new(options.index_capacity)
            .ok_or_else(|| anyhow!("index cache capacity must be greater than zero"))?;
        let profile_capacity = NonZeroUsize::new(options.profile_capacity)
            .ok_or_else(|| anyhow!("profile cache capacity must be greater than zero"))?;

        Ok(Self {
            store,
            embedder,
            options,
            state: Mutex::new(CacheState {
                indexes: LruCache::new(index_capacity),
                profiles: LruCache::new(profile_capacity),
                epoch: 0,
            }),
            rebuilds: AtomicU64::new(0),
        })
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("failed to lock retrieval cache"))
    }

    /// Top `k` memories of `user_id` for `query`, with access counters bumped.
    pub async fn retrieve(&self, user_id: Uuid, query: &str, k: usize) -> Result<Vec<Memory>> {
        let hits = self.search(user_id, query, k).await?;
        Ok(hits.into_iter().map(|hit| hit.memory).collect())
    }

    pub async fn search(&self, user_id: Uuid, query: &str, k: usize) -> Result<Vec<ScoredMemory>> {
        if query.trim().chars().count() < self.options.min_query_chars || k == 0 {
            return Ok(Vec::new());
        }

        let index = self.index_for(user_id).await?;
        if index.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedding provider returned no vector for query"))?;

        let mut hits = index.search(&query_embedding, k);
        if hits.is_empty() {
            return Ok(hits);
        }

        let ids = hits.iter().map(|hit| hit.memory.id).collect::<Vec<_>>();
        // the index holds build-time copies, so counters come from the store
        match self.store.record_memory_access(ids).await {
            Ok(counts) => {
                for hit in &mut hits {
                    if let Some((count, at)) = counts.get(&hit.memory.id) {
                        hit.memory.access_count = *count;
                        hit.memory.last_accessed = Some(*at);
                    }
                }
            }
            Err(e) => tracing::warn!(user = %user_id, "failed to record memory access: {e}"),
        }

        Ok(hits)
    }

    async fn index_for(&self, user_id: Uuid) -> Result<Arc<VectorIndex>> {
        let epoch = {
            let mut state = self.lock_state()?;
            if let Some(index) = state.indexes.get(&user_id) {
                tracing::debug!(user = %user_id, "retrieval cache hit");
                return Ok(Arc::clone(index));
            }
            state.epoch
        };

        let memories = self
            .store
            .user_memories(user_id, MemoryOrder::Recency, None)
            .await?;
        let texts = memories
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>();
        let embedded = self.embedder.embed(&texts).await?;
        let index = Arc::new(VectorIndex::build(
            embedded.model,
            embedded.dimensions,
            memories,
            embedded.embeddings,
        )?);
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(user = %user_id, memories = index.len(), "built memory index");

        let mut state = self.lock_state()?;
        if state.epoch == epoch {
            if let Some((evicted, _)) = state.indexes.push(user_id, Arc::clone(&index)) {
                if evicted != user_id {
                    tracing::info!(evicted = %evicted, "evicted least recently used memory index");
                }
            }
        }
        Ok(index)
    }

    /// Cached user record, loaded from the store on a miss.
    pub async fn profile(&self, user_id: Uuid) -> Result<Option<User>> {
        let epoch = {
            let mut state = self.lock_state()?;
            if let Some(user) = state.profiles.get(&user_id) {
                return Ok(Some(user.clone()));
            }
            state.epoch
        };

        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(None);
        };
        self.admit_profile(epoch, user.clone())?;
        Ok(Some(user))
    }

    /// Caches a profile read under `epoch` unless an invalidation happened since.
    fn admit_profile(&self, epoch: u64, user: User) -> Result<bool> {
        let mut state = self.lock_state()?;
        if state.epoch != epoch {
            tracing::debug!(user = %user.id, "dropping profile read before an invalidation");
            return Ok(false);
        }
        state.profiles.put(user.id, user);
        Ok(true)
    }

    /// Drops the cached index and profile of one user.
    pub fn invalidate(&self, user_id: Uuid) -> Result<()> {
        let mut state = self.lock_state()?;
        state.indexes.pop(&user_id);
        state.profiles.pop(&user_id);
        state.epoch += 1;
        tracing::debug!(user = %user_id, "invalidated retrieval cache entry");
        Ok(())
    }

    /// Drops everything; the next access for any user rebuilds cold.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        state.indexes.clear();
        state.profiles.clear();
        state.epoch += 1;
        tracing::info!("retrieval cache cleared");
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let state = self.lock_state()?;
        Ok(CacheStats {
            index_count: state.indexes.len(),
            index_capacity: state.indexes.cap().get(),
            profile_count: state.profiles.len(),
            profile_capacity: state.profiles.cap().get(),
            index_keys: state
                .indexes
                .iter()
                .map(|(user, index)| format!("{user}:{}", index.model()))
                .collect(),
            profile_keys: state.profiles.iter().map(|(user, _)| user.to_string()).collect(),
            rebuilds: self.rebuilds.load(Ordering::SeqCst),
        })
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }
}
