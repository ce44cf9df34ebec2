use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agir_memory::RetrievalOptions;
use agir_provider::{ProviderConfig, RouterOptions};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentMode {
    #[default]
    Single,
    Multi,
}

fn default_start_assign_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentConfig {
    #[serde(default)]
    pub mode: AssignmentMode,
    #[serde(default = "default_start_assign_count")]
    pub start_assign_count: u32,
    #[serde(default)]
    pub excluded_usernames: Vec<String>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            mode: AssignmentMode::default(),
            start_assign_count: default_start_assign_count(),
            excluded_usernames: Vec::new(),
        }
    }
}

pub const CONCLUSION_MARKER: &str = "I THINK WE'VE REACHED A CONCLUSION";

fn default_max_turns() -> usize {
    10
}

fn default_history_window() -> usize {
    10
}

fn default_conclusion_marker() -> String {
    CONCLUSION_MARKER.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_conclusion_marker")]
    pub conclusion_marker: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            history_window: default_history_window(),
            conclusion_marker: default_conclusion_marker(),
        }
    }
}

fn default_index_capacity() -> usize {
    50
}

fn default_profile_capacity() -> usize {
    100
}

fn default_top_k() -> usize {
    3
}

fn default_min_query_chars() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_index_capacity")]
    pub index_capacity: usize,
    #[serde(default = "default_profile_capacity")]
    pub profile_capacity: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_query_chars")]
    pub min_query_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_capacity: default_index_capacity(),
            profile_capacity: default_profile_capacity(),
            top_k: default_top_k(),
            min_query_chars: default_min_query_chars(),
        }
    }
}

impl RetrievalConfig {
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions {
            index_capacity: self.index_capacity,
            profile_capacity: self.profile_capacity,
            min_query_chars: self.min_query_chars,
        }
    }
}

fn default_model() -> String {
    "stub/echo".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_steps() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Model for users created on the fly when a role declares none.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Condition evaluation and synthesis; the learner's model when unset.
    #[serde(default)]
    pub judge_model: Option<String>,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            judge_model: None,
            default_provider: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            max_steps: default_max_steps(),
        }
    }
}

impl GenerationConfig {
    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            default_provider: self.default_provider.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            max_tokens: self.max_tokens,
        }
    }
}

fn default_importance() -> f64 {
    0.8
}

fn default_max_transcript_chars() -> usize {
    12_000
}

fn default_chunk_chars() -> usize {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_importance")]
    pub default_importance: f64,
    #[serde(default = "default_max_transcript_chars")]
    pub max_transcript_chars: usize,
    /// Target size of one document chunk during ingestion.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            default_importance: default_importance(),
            max_transcript_chars: default_max_transcript_chars(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Hashing,
    OpenAi,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    256
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::default(),
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            base_url: default_embedding_base_url(),
            api_key_env: default_embedding_key_env(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("agir.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assignment: AssignmentConfig::default(),
            conversation: ConversationConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            synthesis: SynthesisConfig::default(),
            providers: Vec::new(),
            aliases: HashMap::new(),
            embedding: EmbeddingConfig::default(),
            database: default_database(),
        }
    }
}

const MAX_RETRIES: u32 = 10;

impl EngineConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse yaml file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.index_capacity == 0 || self.retrieval.profile_capacity == 0 {
            return Err(anyhow!("retrieval cache capacities must be greater than zero"));
        }
        if self.conversation.max_turns == 0 {
            return Err(anyhow!("conversation.max_turns must be at least 1"));
        }
        if self.generation.max_steps == 0 {
            return Err(anyhow!("generation.max_steps must be at least 1"));
        }
        if self.generation.max_retries > MAX_RETRIES {
            return Err(anyhow!(
                "generation.max_retries must be at most {MAX_RETRIES}, got {}",
                self.generation.max_retries
            ));
        }
        if self.synthesis.chunk_chars == 0 {
            return Err(anyhow!("synthesis.chunk_chars must be at least 1"));
        }
        if self.assignment.start_assign_count == 0 {
            return Err(anyhow!("assignment.start_assign_count must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(anyhow!("duplicate provider id: {}", provider.id));
            }
        }
        Ok(())
    }
}
