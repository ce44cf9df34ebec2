use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use agir_provider::{LlmMessage, ModelRouter};
use agir_schema::{Memory, User};
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

use crate::cache::RetrievalCache;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub user_id: Uuid,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub id: String,
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub memories_used: usize,
    pub processing_ms: u64,
}

/// Answers prompts in a user's voice using two retrieval passes over their memories.
pub struct CompletionService {
    cache: Arc<RetrievalCache>,
    router: Arc<ModelRouter>,
    top_k: usize,
}

impl CompletionService {
    pub fn new(cache: Arc<RetrievalCache>, router: Arc<ModelRouter>, top_k: usize) -> Self {
        Self {
            cache,
            router,
            top_k,
        }
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let started = Instant::now();
        let user = self
            .cache
            .profile(request.user_id)
            .await?
            .ok_or_else(|| anyhow!("user not found: {}", request.user_id))?;

        let direct = self
            .cache
            .retrieve(user.id, &request.prompt, self.top_k)
            .await?;

        let analysis = self
            .router
            .generate(&user.model, &domain_analysis_prompt(&request.prompt, &direct))
            .await?;

        let expanded = if analysis.trim().is_empty() {
            Vec::new()
        } else {
            self.cache
                .retrieve(user.id, analysis.trim(), self.top_k)
                .await?
        };

        let context = merge_memories(direct, expanded);
        tracing::debug!(
            user = %user.username,
            memories = context.len(),
            "completion context assembled"
        );

        let system = completion_system_prompt(&user, &context);
        let response = self
            .router
            .chat(
                &user.model,
                Some(system.clone()),
                vec![LlmMessage::user(request.prompt.clone())],
                request.max_tokens,
                request.temperature,
            )
            .await?;

        let prompt_tokens = response
            .input_tokens
            .unwrap_or_else(|| word_count(&system) + word_count(&request.prompt));
        let completion_tokens = response
            .output_tokens
            .unwrap_or_else(|| word_count(&response.text));

        Ok(Completion {
            id: completion_id(),
            text: response.text,
            model: user.model,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            memories_used: context.len(),
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn domain_analysis_prompt(prompt: &str, recalled: &[Memory]) -> String {
    let mut out = String::from(
        "List the knowledge domains and background topics someone would need to answer the \
         question below well, beyond what they already recall. Reply with a short \
         comma-separated list and nothing else.\n\n",
    );
    out.push_str(&format!("Question: {prompt}\n"));
    if !recalled.is_empty() {
        out.push_str("\nAlready recalled:\n");
        for memory in recalled {
            out.push_str(&format!("- {}\n", memory.content));
        }
    }
    out
}

fn completion_system_prompt(user: &User, memories: &[Memory]) -> String {
    let mut system = format!(
        "You are {}. Respond based on your knowledge and the provided context.",
        user.display_name()
    );
    if !user.profile.description.is_empty() {
        system.push_str(&format!("\n\nAbout you: {}", user.profile.description));
    }
    if !memories.is_empty() {
        system.push_str("\n\nRelevant knowledge and memories:\n");
        for memory in memories {
            system.push_str(&format!("- {}\n", memory.content));
        }
    }
    system
}

/// First pass then second pass, without repeats.
fn merge_memories(first: Vec<Memory>, second: Vec<Memory>) -> Vec<Memory> {
    let mut seen = HashSet::new();
    first
        .into_iter()
        .chain(second)
        .filter(|m| seen.insert(m.id))
        .collect()
}

fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn completion_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("cmpl-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RetrievalOptions;
    use crate::embedding::HashingEmbeddingProvider;
    use agir_provider::{
        LlmProvider, LlmRequest, LlmResponse, ProviderRegistry, RouterOptions,
    };
    use agir_schema::{UserKind, UserProfile};
    use agir_store::Store;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers the domain-analysis call with a fixed topic list and records
    /// the final system prompt.
    struct AnalystProvider {
        topics: String,
        systems: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LlmProvider for AnalystProvider {
        async fn chat(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
            match request.system {
                None => Ok(LlmResponse {
                    text: self.topics.clone(),
                    input_tokens: None,
                    output_tokens: None,
                    stop_reason: None,
                }),
                Some(system) => {
                    self.systems.lock().unwrap().push(system);
                    Ok(LlmResponse {
                        text: "final answer here".into(),
                        input_tokens: None,
                        output_tokens: None,
                        stop_reason: None,
                    })
                }
            }
        }
    }

    async fn service(topics: &str) -> (Store, CompletionService, Arc<Mutex<Vec<String>>>) {
        let store = Store::open_in_memory().unwrap();
        let cache = Arc::new(
            RetrievalCache::new(
                store.clone(),
                Arc::new(HashingEmbeddingProvider::new(128)),
                RetrievalOptions::default(),
            )
            .unwrap(),
        );
        let systems = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ProviderRegistry::new();
        registry.register(
            "analyst",
            Arc::new(AnalystProvider {
                topics: topics.to_string(),
                systems: systems.clone(),
            }),
        );
        let router = Arc::new(ModelRouter::new(
            registry,
            HashMap::new(),
            RouterOptions {
                default_provider: Some("analyst".into()),
                ..Default::default()
            },
        ));
        (store, CompletionService::new(cache, router, 3), systems)
    }

    #[tokio::test]
    async fn second_pass_pulls_in_background_knowledge() {
        let (store, service, systems) = service("pharmacology, dosage").await;
        let user = store
            .find_or_create_user(
                User::new("dr_lee", UserKind::Agent, "local-model").with_profile(UserProfile {
                    first_name: "Dana".into(),
                    last_name: "Lee".into(),
                    description: String::new(),
                }),
            )
            .await
            .unwrap();
        store
            .insert_memory(Memory::new(user.id, "the ward round starts at eight", 0.5))
            .await
            .unwrap();
        store
            .insert_memory(Memory::new(user.id, "pharmacology dosage tables by weight", 0.5))
            .await
            .unwrap();

        let completion = service
            .complete(CompletionRequest {
                prompt: "when does the ward round start".into(),
                user_id: user.id,
                temperature: Some(0.3),
                max_tokens: Some(200),
            })
            .await
            .unwrap();

        assert!(completion.id.starts_with("cmpl-"));
        assert_eq!(completion.id.len(), "cmpl-".len() + 20);
        assert_eq!(completion.text, "final answer here");
        assert_eq!(completion.model, "local-model");
        assert_eq!(completion.memories_used, 2);
        assert_eq!(completion.usage.completion_tokens, 3);
        assert_eq!(
            completion.usage.total_tokens,
            completion.usage.prompt_tokens + completion.usage.completion_tokens
        );

        let systems = systems.lock().unwrap();
        assert!(systems[0].starts_with("You are Dana Lee."));
        assert!(systems[0].contains("ward round"));
        assert!(systems[0].contains("pharmacology"));
    }

    #[tokio::test]
    async fn unknown_user_is_an_error() {
        let (_store, service, _) = service("x").await;
        let err = service
            .complete(CompletionRequest {
                prompt: "hello there".into(),
                user_id: Uuid::new_v4(),
                temperature: None,
                max_tokens: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user not found"));
    }

    #[test]
    fn merge_drops_repeats() {
        let user = Uuid::new_v4();
        let a = Memory::new(user, "a", 0.5);
        let b = Memory::new(user, "b", 0.5);
        let merged = merge_memories(vec![a.clone(), b.clone()], vec![b, a]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "a");
    }
}
