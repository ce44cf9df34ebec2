//! Model invocation: the [`LlmProvider`] seam, a registry of configured
//! providers, and [`ModelRouter`], which maps model identifiers onto them.

pub mod openai;
pub mod router;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use openai::OpenAiProvider;
pub use router::{detect_provider, GenerationError, ModelRouter, RouterOptions};
pub use types::*;

/// Marker a provider puts in an error message when the router may retry it.
pub const RETRYABLE_TAG: &str = "[retryable]";

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;
}

// ============================================================
// Provider Configuration
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAI,
    Anthropic,
    DeepSeek,
    Ollama,
    /// Any other endpoint speaking the chat-completions protocol
    Custom,
    /// Offline echo provider
    Stub,
}

impl ProviderType {
    /// Chat-completions base URL used when the config gives none.
    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            ProviderType::OpenAI => Some("https://api.openai.com/v1"),
            ProviderType::Anthropic => Some("https://api.anthropic.com/v1"),
            ProviderType::DeepSeek => Some("https://api.deepseek.com/v1"),
            ProviderType::Ollama => Some("http://localhost:11434/v1"),
            ProviderType::Custom | ProviderType::Stub => None,
        }
    }

    fn needs_key(self) -> bool {
        !matches!(self, ProviderType::Ollama | ProviderType::Stub)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry id, also the prefix in `provider/model` identifiers
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key, read when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, provider_type: ProviderType) -> Self {
        Self {
            id: id.into(),
            provider_type,
            api_key: None,
            api_key_env: None,
            base_url: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        if let Some(var) = &self.api_key_env {
            return std::env::var(var).map_err(|_| anyhow!("{var} is not set"));
        }
        if self.provider_type.needs_key() {
            return Err(anyhow!("provider {} requires api_key", self.id));
        }
        // local servers ignore the header
        Ok(self.id.clone())
    }
}

pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    if config.provider_type == ProviderType::Stub {
        return Ok(Arc::new(StubProvider));
    }
    let base_url = config
        .base_url
        .as_deref()
        .or(config.provider_type.default_base_url())
        .ok_or_else(|| anyhow!("provider {} requires base_url", config.id))?;
    Ok(Arc::new(OpenAiProvider::new(config.api_key()?, base_url)))
}

pub fn register_from_configs(
    registry: &mut ProviderRegistry,
    configs: &[ProviderConfig],
) -> Result<()> {
    for config in configs {
        let provider = create_provider(config)?;
        registry.register(&config.id, provider);
        tracing::info!("Registered provider: {} ({:?})", config.id, config.provider_type);
    }
    Ok(())
}

// ============================================================
// Provider Registry
// ============================================================

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not found: {id}"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }
}

/// Echoes the last user message back; used offline and in tests.
pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let text = format!("[stub:{}] {}", request.model, user_text);
        let output_tokens = text.split_whitespace().count() as u32;
        Ok(LlmResponse {
            text,
            input_tokens: None,
            output_tokens: Some(output_tokens),
            stop_reason: Some("end_turn".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_registry_get_registered_succeeds() {
        let mut registry = ProviderRegistry::new();
        registry.register("stub", Arc::new(StubProvider));

        assert!(registry.get("stub").is_ok());
        assert!(registry.contains("stub"));
        assert!(!registry.contains("openai"));
    }

    #[test]
    fn provider_registry_get_unknown_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.get("missing").err().unwrap();
        assert!(err.to_string().contains("provider not found: missing"));
    }

    #[tokio::test]
    async fn stub_provider_chat_returns_expected_format() {
        let provider = StubProvider;
        let req = LlmRequest {
            model: "my-model".into(),
            system: None,
            messages: vec![LlmMessage::user("ping")],
            max_tokens: 100,
            temperature: None,
        };
        let resp = provider.chat(req).await.unwrap();
        assert_eq!(resp.text, "[stub:my-model] ping");
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn stub_provider_chat_empty_messages() {
        let provider = StubProvider;
        let req = LlmRequest {
            model: "m".into(),
            system: None,
            messages: vec![],
            max_tokens: 100,
            temperature: None,
        };
        let resp = provider.chat(req).await.unwrap();
        assert!(resp.text.starts_with("[stub:m]"));
    }

    #[test]
    fn provider_config_parses_type_tags() {
        let raw = r#"[
            {"id": "local", "type": "ollama", "base_url": "http://127.0.0.1:11434/v1"},
            {"id": "openai", "type": "openai", "api_key_env": "OPENAI_API_KEY"},
            {"id": "ds", "type": "deepseek", "api_key": "sk-x"}
        ]"#;
        let parsed: Vec<ProviderConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].provider_type, ProviderType::Ollama);
        assert_eq!(parsed[1].provider_type, ProviderType::OpenAI);
        assert_eq!(parsed[1].api_key_env.as_deref(), Some("OPENAI_API_KEY"));
        assert_eq!(parsed[2].provider_type, ProviderType::DeepSeek);
    }

    #[test]
    fn create_provider_requires_key_for_openai() {
        let config = ProviderConfig::new("openai", ProviderType::OpenAI);
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("requires api_key"));
    }

    #[test]
    fn create_provider_custom_requires_base_url() {
        let config = ProviderConfig::new("mine", ProviderType::Custom).with_api_key("k");
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("requires base_url"));

        let config = config.with_base_url("https://llm.example.com/v1");
        assert!(create_provider(&config).is_ok());
    }

    #[test]
    fn local_providers_need_no_key() {
        let config = ProviderConfig::new("local", ProviderType::Ollama);
        assert!(create_provider(&config).is_ok());
        assert_eq!(
            ProviderType::Ollama.default_base_url(),
            Some("http://localhost:11434/v1")
        );
        assert_eq!(ProviderType::Custom.default_base_url(), None);
    }

    #[test]
    fn register_from_configs_registers_all() {
        let mut registry = ProviderRegistry::new();
        let configs = vec![
            ProviderConfig::new("stub", ProviderType::Stub),
            ProviderConfig::new("local", ProviderType::Ollama),
        ];
        register_from_configs(&mut registry, &configs).unwrap();
        assert!(registry.contains("stub"));
        assert!(registry.contains("local"));
    }
}
