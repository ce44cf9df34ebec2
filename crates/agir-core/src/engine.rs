use std::path::Path;
use std::sync::Arc;

use agir_memory::{
    CacheStats, Completion, CompletionRequest, CompletionService, EmbeddingProvider,
    HashingEmbeddingProvider, OpenAiEmbeddingProvider, PersistentEmbeddingProvider,
    RetrievalCache,
};
use agir_provider::{register_from_configs, ModelRouter, ProviderRegistry, StubProvider};
use agir_schema::{Memory, Scenario, User};
use agir_store::{EmbeddingCacheStat, MemoryOrder, Store};
use anyhow::{anyhow, Context};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assignment::{AgentAssignmentResolver, AssignmentCounters, CountMismatch};
use crate::config::{EmbeddingBackend, EngineConfig};
use crate::conversation::ConversationRunner;
use crate::episode::{EpisodeDriver, EpisodeResult};
use crate::error::{EngineError, EngineResult};
use crate::scenario::{InstalledScenario, ScenarioDefinition};
use crate::step::StepExecutor;
use crate::synthesis::MemorySynthesizer;
use crate::transition::TransitionResolver;

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentRow {
    pub role: String,
    pub username: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentReport {
    pub scenario: String,
    pub rows: Vec<AssignmentRow>,
    pub threshold: u32,
    pub mismatches: Vec<CountMismatch>,
}

/// Wires store, providers, cache and the episode machinery together.
pub struct Engine {
    config: EngineConfig,
    store: Store,
    cache: Arc<RetrievalCache>,
    counters: Arc<AssignmentCounters>,
    driver: EpisodeDriver,
    synthesizer: Arc<MemorySynthesizer>,
    completions: CompletionService,
    shutdown: CancellationToken,
}

impl Engine {
    /// Opens the configured database and registers the configured providers.
    /// A `stub` provider is always available.
    pub async fn from_config(config: EngineConfig) -> EngineResult<Self> {
        let store = Store::open(&config.database).with_context(|| {
            format!("failed to open database: {}", config.database.display())
        })?;
        let mut registry = ProviderRegistry::new();
        register_from_configs(&mut registry, &config.providers)?;
        if !registry.contains("stub") {
            registry.register("stub", Arc::new(StubProvider));
        }
        Self::with_parts(config, store, registry).await
    }

    pub async fn with_parts(
        config: EngineConfig,
        store: Store,
        registry: ProviderRegistry,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Construction(e.to_string()))?;

        let router = Arc::new(ModelRouter::new(
            registry,
            config.aliases.clone(),
            config.generation.router_options(),
        ));
        let embedder = embedding_provider(&config, &store)?;
        let cache = Arc::new(RetrievalCache::new(
            store.clone(),
            embedder,
            config.retrieval.options(),
        )?);

        let counters = Arc::new(AssignmentCounters::new(config.assignment.start_assign_count));
        counters.seed_from_store(&store).await?;
        let assignments = Arc::new(AgentAssignmentResolver::new(
            store.clone(),
            router.clone(),
            counters.clone(),
            config.assignment.clone(),
            config.generation.default_model.clone(),
        ));

        let conversations =
            ConversationRunner::new(store.clone(), router.clone(), config.conversation.clone());
        let executor = StepExecutor::new(
            store.clone(),
            router.clone(),
            cache.clone(),
            assignments,
            conversations,
            config.retrieval.top_k,
        );
        let synthesizer = Arc::new(MemorySynthesizer::new(
            store.clone(),
            router.clone(),
            cache.clone(),
            config.synthesis.clone(),
            config.generation.judge_model.clone(),
        ));
        let driver = EpisodeDriver::new(
            store.clone(),
            executor,
            TransitionResolver::new(store.clone(), router.clone()),
            synthesizer.clone(),
            config.generation.judge_model.clone(),
            config.generation.max_steps,
        );
        let completions = CompletionService::new(cache.clone(), router, config.retrieval.top_k);

        Ok(Self {
            config,
            store,
            cache,
            counters,
            driver,
            synthesizer,
            completions,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn counters(&self) -> &AssignmentCounters {
        &self.counters
    }

    /// Cancelling this token stops every running episode at its next iteration.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn install_scenario(
        &self,
        definition: &ScenarioDefinition,
    ) -> EngineResult<InstalledScenario> {
        let installed = definition
            .install(&self.store, &self.config.generation.default_model)
            .await?;
        if let Some(learner) = &installed.learner {
            self.cache.invalidate(learner.id)?;
        }
        Ok(installed)
    }

    pub async fn scenario_by_name(&self, name: &str) -> EngineResult<Scenario> {
        self.store
            .find_scenario_by_name(name)
            .await?
            .ok_or_else(|| EngineError::not_found("scenario", name))
    }

    pub async fn user_by_name(&self, username: &str) -> EngineResult<User> {
        self.store
            .find_user_by_username(username)
            .await?
            .ok_or_else(|| EngineError::not_found("user", username))
    }

    pub async fn run_episode(
        &self,
        scenario_id: Uuid,
        learner_id: Uuid,
    ) -> EngineResult<EpisodeResult> {
        self.driver
            .run_episode(scenario_id, learner_id, &self.shutdown)
            .await
    }

    pub async fn run_episodes(
        &self,
        scenario_id: Uuid,
        learner_id: Uuid,
        count: usize,
        concurrency: usize,
    ) -> Vec<EngineResult<EpisodeResult>> {
        self.driver
            .run_episodes(scenario_id, learner_id, count, concurrency, &self.shutdown)
            .await
    }

    pub async fn synthesize(&self, episode_id: Uuid) -> EngineResult<Vec<Memory>> {
        self.synthesizer.synthesize(episode_id).await
    }

    pub async fn complete(
        &self,
        prompt: &str,
        user_id: Uuid,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> EngineResult<Completion> {
        self.completions
            .complete(CompletionRequest {
                prompt: prompt.to_string(),
                user_id,
                temperature,
                max_tokens,
            })
            .await
            .map_err(EngineError::from_pipeline)
    }

    pub fn clear_cache(&self) -> EngineResult<()> {
        Ok(self.cache.clear()?)
    }

    pub fn cache_stats(&self) -> EngineResult<CacheStats> {
        Ok(self.cache.stats()?)
    }

    /// Entry counts of the persisted embedding cache, per namespace.
    pub async fn embedding_cache_stats(&self) -> EngineResult<Vec<EmbeddingCacheStat>> {
        Ok(self.store.embedding_cache_stats().await?)
    }

    /// Reads a text file into document memories for `user_id`, named after
    /// the file stem.
    pub async fn ingest_document(&self, user_id: Uuid, path: &Path) -> EngineResult<Vec<Memory>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read document: {}", path.display()))?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.synthesizer
            .ingest_document(user_id, &name, &content)
            .await
    }

    /// Stores a manual or document memory and drops the user's cached index.
    pub async fn add_memory(
        &self,
        user_id: Uuid,
        content: &str,
        importance: f64,
        document: Option<&str>,
    ) -> EngineResult<Memory> {
        if content.trim().is_empty() {
            return Err(EngineError::Persistence(anyhow!("memory content is empty")));
        }
        let mut memory = Memory::new(user_id, content.trim(), importance);
        if let Some(document) = document {
            memory = memory.with_document(document);
        }
        self.store.insert_memory(memory.clone()).await?;
        self.cache.invalidate(user_id)?;
        Ok(memory)
    }

    pub async fn user_memories(
        &self,
        user_id: Uuid,
        order: MemoryOrder,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Memory>> {
        Ok(self.store.user_memories(user_id, order, limit).await?)
    }

    /// Persisted assignment counts for the scenario's roles plus a consistency
    /// check of the in-process counters.
    pub async fn assignment_report(&self, scenario_id: Uuid) -> EngineResult<AssignmentReport> {
        let scenario = self
            .store
            .get_scenario(scenario_id)
            .await?
            .ok_or_else(|| EngineError::not_found("scenario", scenario_id))?;
        let roles = self.store.scenario_roles(scenario_id).await?;

        let mut rows = Vec::new();
        for count in self.store.assignment_counts().await? {
            let Some(role) = roles.iter().find(|r| r.id == count.role_id) else {
                continue;
            };
            let username = match self.store.get_user(count.user_id).await? {
                Some(user) => user.username,
                None => count.user_id.to_string(),
            };
            rows.push(AssignmentRow {
                role: role.name.clone(),
                username,
                count: count.count,
            });
        }

        Ok(AssignmentReport {
            scenario: scenario.name,
            rows,
            threshold: self.counters.threshold()?,
            mismatches: self.counters.validate(&self.store).await?,
        })
    }
}

fn embedding_provider(
    config: &EngineConfig,
    store: &Store,
) -> EngineResult<Arc<dyn EmbeddingProvider>> {
    let settings = &config.embedding;
    let provider: Arc<dyn EmbeddingProvider> = match settings.provider {
        EmbeddingBackend::Hashing => Arc::new(HashingEmbeddingProvider::new(settings.dimensions)),
        EmbeddingBackend::OpenAi => {
            let api_key = std::env::var(&settings.api_key_env)
                .map_err(|_| anyhow!("{} is not set", settings.api_key_env))?;
            let inner = OpenAiEmbeddingProvider::new(
                &settings.base_url,
                api_key,
                settings.model.clone(),
                settings.dimensions,
            );
            Arc::new(PersistentEmbeddingProvider::new(
                inner,
                store.clone(),
                &settings.base_url,
            ))
        }
    };
    Ok(provider)
}
