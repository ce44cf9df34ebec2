use agir_provider::ModelRouter;
use agir_schema::{Role, UserProfile};
use serde::Deserialize;
use uuid::Uuid;

use crate::synthesis::strip_json_fence;

const FIRST_NAMES: &[&str] = &[
    "Alex", "Jordan", "Taylor", "Morgan", "Casey", "Riley", "Jamie", "Avery", "Quinn", "Harper",
    "Rowan", "Sasha", "Noor", "Mateo", "Ines", "Kenji",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Garcia", "Okafor", "Nakamura", "Novak", "Larsen", "Moreau", "Patel", "Kowalski",
    "Haddad", "Reyes", "Lindqvist", "Osei", "Brennan", "Ferreira", "Tanaka",
];

#[derive(Debug, Deserialize)]
struct GeneratedProfile {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    description: String,
}

fn profile_prompt(role: &Role, scenario_description: &str) -> String {
    let mut prompt = format!(
        "Generate a realistic profile for a person with the role of \"{}\".",
        role.name
    );
    if !role.description.trim().is_empty() {
        prompt.push_str(&format!("\nRole description: {}", role.description.trim()));
    }
    if !scenario_description.trim().is_empty() {
        prompt.push_str(&format!("\nScenario: {}", scenario_description.trim()));
    }
    prompt.push_str(
        "\n\nReturn the profile as a JSON object with the fields \"first_name\", \
         \"last_name\" and \"description\" (two or three sentences of background). \
         Respond with ONLY the JSON object.",
    );
    prompt
}

/// A profile from the model answer, or `None` when the answer has no usable name.
fn parse_profile(output: &str) -> Option<UserProfile> {
    let generated: GeneratedProfile = serde_json::from_str(strip_json_fence(output)).ok()?;
    let first_name = generated.first_name.trim().to_string();
    let last_name = generated.last_name.trim().to_string();
    if first_name.is_empty() && last_name.is_empty() {
        return None;
    }
    Some(UserProfile {
        first_name,
        last_name,
        description: generated.description.trim().to_string(),
    })
}

/// Names picked from fixed lists by `seed`, so the same seed always yields the same person.
pub(crate) fn fallback_profile(role: &Role, seed: Uuid) -> UserProfile {
    let bits = seed.as_u128();
    let first = FIRST_NAMES[(bits % FIRST_NAMES.len() as u128) as usize];
    let last = LAST_NAMES[((bits >> 64) % LAST_NAMES.len() as u128) as usize];
    UserProfile {
        first_name: first.to_string(),
        last_name: last.to_string(),
        description: role.description.clone(),
    }
}

/// Asks `model` for a persona playing `role`. Any failure falls back to a
/// deterministic name so agent creation never fails on profile generation.
pub(crate) async fn generate_profile(
    router: &ModelRouter,
    model: &str,
    role: &Role,
    scenario_description: &str,
    seed: Uuid,
) -> UserProfile {
    let prompt = profile_prompt(role, scenario_description);
    match router.generate(model, &prompt).await {
        Ok(output) => match parse_profile(&output) {
            Some(mut profile) => {
                if profile.description.is_empty() {
                    profile.description = role.description.clone();
                }
                profile
            }
            None => {
                tracing::warn!(role = %role.name, "agent profile answer unusable, using fallback name");
                fallback_profile(role, seed)
            }
        },
        Err(err) => {
            tracing::warn!(role = %role.name, error = %err, "agent profile generation failed, using fallback name");
            fallback_profile(role, seed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_provider::{LlmProvider, LlmRequest, LlmResponse, ProviderRegistry, RouterOptions};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Fixed(&'static str);

    #[async_trait]
    impl LlmProvider for Fixed {
        async fn chat(&self, _request: LlmRequest) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse {
                text: self.0.to_string(),
                input_tokens: None,
                output_tokens: None,
                stop_reason: None,
            })
        }
    }

    fn router(answer: &'static str) -> ModelRouter {
        let mut registry = ProviderRegistry::new();
        registry.register("fixed", Arc::new(Fixed(answer)));
        ModelRouter::new(registry, HashMap::new(), RouterOptions::default())
    }

    fn coach() -> Role {
        Role {
            id: Uuid::new_v4(),
            scenario_id: Uuid::new_v4(),
            name: "coach".into(),
            description: "keeps the learner on track".into(),
            model: None,
        }
    }

    #[tokio::test]
    async fn generated_profile_is_used_when_parseable() {
        let router = router(
            "```json\n{\"first_name\":\"Mira\",\"last_name\":\"Sol\",\"description\":\"Former athlete.\"}\n```",
        );
        let profile = generate_profile(&router, "fixed/m", &coach(), "", Uuid::new_v4()).await;
        assert_eq!(profile.first_name, "Mira");
        assert_eq!(profile.last_name, "Sol");
        assert_eq!(profile.description, "Former athlete.");
    }

    #[tokio::test]
    async fn unusable_answer_falls_back_deterministically() {
        let router = router("I would rather not.");
        let role = coach();
        let seed = Uuid::new_v4();
        let first = generate_profile(&router, "fixed/m", &role, "", seed).await;
        let second = generate_profile(&router, "fixed/m", &role, "", seed).await;
        assert_eq!(first, second);
        assert!(!first.first_name.is_empty());
        assert_eq!(first.description, "keeps the learner on track");
    }

    #[tokio::test]
    async fn unknown_model_falls_back() {
        let router = router("{}");
        let profile = generate_profile(&router, "missing/m", &coach(), "", Uuid::nil()).await;
        assert_eq!(profile, fallback_profile(&coach(), Uuid::nil()));
    }

    #[test]
    fn nameless_json_is_rejected() {
        assert!(parse_profile(r#"{"description":"no name"}"#).is_none());
        assert!(parse_profile("not json").is_none());
    }
}
