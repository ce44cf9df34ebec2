use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time;

use crate::{LlmMessage, LlmRequest, LlmResponse, ProviderRegistry, RETRYABLE_TAG};

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("unknown model {model}: {reason}")]
    UnknownModel { model: String, reason: String },
    #[error("model {model} timed out after {secs}s")]
    Timeout { model: String, secs: u64 },
    #[error("model {model} failed: {message}")]
    Provider { model: String, message: String },
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout { .. } => true,
            GenerationError::Provider { message, .. } => message.contains(RETRYABLE_TAG),
            GenerationError::UnknownModel { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Provider used when neither an explicit prefix nor a known model family matches.
    pub default_provider: Option<String>,
    pub timeout: Duration,
    /// Extra attempts for `[retryable]` failures. Zero makes every call fail-fast.
    pub max_retries: u32,
    pub max_tokens: u32,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            default_provider: None,
            timeout: Duration::from_secs(60),
            max_retries: 0,
            max_tokens: 1024,
        }
    }
}

/// Maps model identifiers onto registered providers and invokes them.
pub struct ModelRouter {
    registry: ProviderRegistry,
    aliases: HashMap<String, String>,
    options: RouterOptions,
}

/// Delay before retry number `attempt` (1-based): doubling from
/// `BASE_BACKOFF_MS`, capped at `MAX_BACKOFF_MS`.
fn backoff_ms(attempt: u32) -> u64 {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    BASE_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// Provider family implied by a bare model name.
pub fn detect_provider(model: &str) -> Option<&'static str> {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("gpt-") || lower.starts_with("o1") || lower.starts_with("o3") {
        return Some("openai");
    }
    if lower.starts_with("claude-") {
        return Some("anthropic");
    }
    if lower.starts_with("deepseek") {
        return Some("deepseek");
    }
    const OLLAMA_FAMILIES: [&str; 5] = ["llama", "phi", "mistral", "mixtral", "qwen"];
    if OLLAMA_FAMILIES.iter().any(|f| lower.starts_with(f)) {
        return Some("ollama");
    }
    None
}

impl ModelRouter {
    pub fn new(
        registry: ProviderRegistry,
        aliases: HashMap<String, String>,
        options: RouterOptions,
    ) -> Self {
        Self {
            registry,
            aliases,
            options,
        }
    }

    /// Resolves `model` to `(provider_id, model_name)`.
    pub fn resolve(&self, model: &str) -> Result<(String, String), GenerationError> {
        let target = self.aliases.get(model).map(String::as_str).unwrap_or(model);

        if let Some((provider, name)) = target.split_once('/') {
            if self.registry.contains(provider) {
                return Ok((provider.to_string(), name.to_string()));
            }
        }

        if let Some(provider) = detect_provider(target) {
            if self.registry.contains(provider) {
                return Ok((provider.to_string(), target.to_string()));
            }
        }

        match &self.options.default_provider {
            Some(provider) if self.registry.contains(provider) => {
                Ok((provider.clone(), target.to_string()))
            }
            _ => Err(GenerationError::UnknownModel {
                model: model.to_string(),
                reason: "no registered provider serves this model".to_string(),
            }),
        }
    }

    /// Single-prompt generation.
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerationError> {
        let resp = self
            .chat(model, None, vec![LlmMessage::user(prompt)], None, None)
            .await?;
        Ok(resp.text)
    }

    pub async fn chat(
        &self,
        model: &str,
        system: Option<String>,
        messages: Vec<LlmMessage>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<LlmResponse, GenerationError> {
        let (provider_id, model_name) = self.resolve(model)?;
        let provider = self
            .registry
            .get(&provider_id)
            .map_err(|e| GenerationError::UnknownModel {
                model: model.to_string(),
                reason: e.to_string(),
            })?;

        let mut attempts = 0;
        loop {
            let request = LlmRequest {
                model: model_name.clone(),
                system: system.clone(),
                messages: messages.clone(),
                max_tokens: max_tokens.unwrap_or(self.options.max_tokens),
                temperature,
            };

            let outcome = match time::timeout(self.options.timeout, provider.chat(request)).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(err)) => GenerationError::Provider {
                    model: model.to_string(),
                    message: format!("{err:#}"),
                },
                Err(_) => GenerationError::Timeout {
                    model: model.to_string(),
                    secs: self.options.timeout.as_secs(),
                },
            };

            if outcome.is_retryable() && attempts < self.options.max_retries {
                attempts += 1;
                let backoff = backoff_ms(attempts);
                tracing::warn!(
                    "provider {provider_id} retryable error (attempt {attempts}/{}), backing off {backoff}ms: {outcome}",
                    self.options.max_retries
                );
                time::sleep(Duration::from_millis(backoff)).await;
                continue;
            }

            tracing::warn!(provider = %provider_id, model = %model_name, attempts, "generation failed: {outcome}");
            return Err(outcome);
        }
    }
}
