use std::sync::Arc;

use agir_memory::RetrievalCache;
use agir_provider::ModelRouter;
use agir_schema::{clamp_importance, EpisodeStatus, Memory, StepStatus};
use agir_store::Store;
use uuid::Uuid;

use crate::config::SynthesisConfig;
use crate::conversation::render_transcript;
use crate::error::{EngineError, EngineResult};

/// Turns a completed episode into learner memories.
pub struct MemorySynthesizer {
    store: Store,
    router: Arc<ModelRouter>,
    cache: Arc<RetrievalCache>,
    config: SynthesisConfig,
    judge_model: Option<String>,
}

impl MemorySynthesizer {
    pub fn new(
        store: Store,
        router: Arc<ModelRouter>,
        cache: Arc<RetrievalCache>,
        config: SynthesisConfig,
        judge_model: Option<String>,
    ) -> Self {
        Self {
            store,
            router,
            cache,
            config,
            judge_model,
        }
    }

    /// Returns the episode's memories, generating them on the first call only.
    pub async fn synthesize(&self, episode_id: Uuid) -> EngineResult<Vec<Memory>> {
        let episode = self
            .store
            .get_episode(episode_id)
            .await?
            .ok_or_else(|| EngineError::not_found("episode", episode_id))?;
        if episode.status != EpisodeStatus::Completed {
            return Err(EngineError::EpisodeNotCompleted(episode_id));
        }

        let existing = self.store.episode_memories(episode_id).await?;
        if !existing.is_empty() {
            tracing::debug!(episode_id = %episode_id, "episode already synthesized");
            return Ok(existing);
        }

        let learner = self
            .store
            .get_user(episode.learner_id)
            .await?
            .ok_or_else(|| EngineError::not_found("user", episode.learner_id))?;
        let scenario = self
            .store
            .get_scenario(episode.scenario_id)
            .await?
            .ok_or_else(|| EngineError::not_found("scenario", episode.scenario_id))?;

        let transcript = self.transcript(episode_id, episode.scenario_id).await?;
        if transcript.trim().is_empty() {
            tracing::info!(episode_id = %episode_id, "empty transcript, nothing to synthesize");
            return Ok(Vec::new());
        }

        let objective = scenario
            .objective
            .clone()
            .unwrap_or_else(|| scenario.description.clone());
        let prompt = format!(
            "You are {name}, reflecting on a completed run of the scenario \"{scenario}\".\n\
             Your objective: {objective}\n\n\
             Transcript:\n{transcript}\n\n\
             Write one or more short reflections that will help you do better next time. \
             Respond with a JSON array of objects, each with a \"content\" string and an \
             \"importance\" number between 0.0 and 1.0.",
            name = learner.display_name(),
            scenario = scenario.name,
        );
        let model = self.judge_model.as_deref().unwrap_or(&learner.model);
        let response = self.router.generate(model, &prompt).await?;

        let memories: Vec<Memory> =
            parse_reflections(&response, self.config.default_importance)
                .into_iter()
                .map(|(content, importance)| {
                    Memory::new(learner.id, content, importance)
                        .with_episode(episode_id, scenario.id)
                })
                .collect();

        let (stored, inserted) = self
            .store
            .insert_episode_memories(episode_id, memories)
            .await?;
        if inserted {
            self.cache.invalidate(learner.id)?;
        }
        tracing::info!(
            episode_id = %episode_id,
            user = %learner.username,
            memories = stored.len(),
            "episode synthesized"
        );
        Ok(stored)
    }

    /// Reads `content` in chunks and stores the user's reflections on each,
    /// tagged with `document`. Nothing is stored unless every chunk succeeds.
    pub async fn ingest_document(
        &self,
        user_id: Uuid,
        document: &str,
        content: &str,
    ) -> EngineResult<Vec<Memory>> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| EngineError::not_found("user", user_id))?;
        let chunks = chunk_document(content, self.config.chunk_chars);
        tracing::info!(
            user = %user.username,
            document,
            chunks = chunks.len(),
            "ingesting document"
        );

        let mut memories = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let prompt = format!(
                "You are {name}. You have just read part {part} of {total} of \"{document}\".

                 {chunk}

                 Reflect on this section: the knowledge worth keeping, how it connects to what                  you already know, and what you would do differently because of it.                  Respond with a JSON array of objects, each with a \"content\" string and an                  \"importance\" number between 0.0 and 1.0.",
                name = user.display_name(),
                part = i + 1,
                total = chunks.len(),
            );
            let response = self.router.generate(&user.model, &prompt).await?;
            memories.extend(
                parse_reflections(&response, self.config.default_importance)
                    .into_iter()
                    .map(|(content, importance)| {
                        Memory::new(user.id, content, importance).with_document(document)
                    }),
            );
            tracing::debug!(document, part = i + 1, "document chunk reflected");
        }

        for memory in &memories {
            self.store.insert_memory(memory.clone()).await?;
        }
        if !memories.is_empty() {
            self.cache.invalidate(user.id)?;
        }
        tracing::info!(
            user = %user.username,
            document,
            memories = memories.len(),
            "document ingested"
        );
        Ok(memories)
    }

    /// `=== state ===` blocks for every completed step, oldest first.
    async fn transcript(&self, episode_id: Uuid, scenario_id: Uuid) -> EngineResult<String> {
        let states = self.store.scenario_states(scenario_id).await?;
        let steps = self.store.episode_steps(episode_id).await?;

        let mut out = String::new();
        for step in steps.iter().filter(|s| s.status == StepStatus::Completed) {
            let name = states
                .iter()
                .find(|s| s.id == step.state_id)
                .map(|s| s.name.as_str())
                .unwrap_or("unknown");
            let body = match step.conversation_id {
                Some(conversation) => {
                    render_transcript(&self.store.conversation_messages(conversation).await?)
                }
                None => step.output.clone().unwrap_or_default(),
            };
            if body.trim().is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("=== {name} ===\n{body}"));
        }
        Ok(truncate_chars(&out, self.config.max_transcript_chars))
    }
}

/// The last `max` characters. The end of an episode carries its outcome, so
/// the head is what gets dropped.
fn truncate_chars(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    match text.char_indices().nth(total - max) {
        Some((cut, _)) => text[cut..].to_string(),
        None => String::new(),
    }
}

/// Paragraph-aligned chunks of at most `max` characters. A paragraph longer
/// than `max` is split on character boundaries.
pub(crate) fn chunk_document(content: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();
        if current_len > 0 && current_len + 2 + len > max {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if len > max {
            let chars: Vec<char> = paragraph.chars().collect();
            for piece in chars.chunks(max) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(paragraph);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Model output with a surrounding Markdown code fence removed.
pub(crate) fn strip_json_fence(output: &str) -> &str {
    let trimmed = output.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// `(content, importance)` pairs from the model answer. Anything that is not a
/// JSON array of reflections becomes a single reflection holding the whole answer.
pub(crate) fn parse_reflections(output: &str, default_importance: f64) -> Vec<(String, f64)> {
    let json_str = strip_json_fence(output);

    let parsed: Vec<(String, f64)> = match serde_json::from_str::<Vec<serde_json::Value>>(json_str)
    {
        Ok(items) => items
            .iter()
            .filter_map(|item| {
                let content = item.get("content").and_then(|v| v.as_str())?.trim();
                if content.is_empty() {
                    return None;
                }
                let importance = item
                    .get("importance")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(default_importance);
                Some((content.to_string(), clamp_importance(importance)))
            })
            .collect(),
        Err(_) => Vec::new(),
    };

    if !parsed.is_empty() {
        return parsed;
    }
    let whole = output.trim();
    if whole.is_empty() {
        return Vec::new();
    }
    vec![(whole.to_string(), clamp_importance(default_importance))]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fenced_array_and_clamps() {
        let out = "```json\n[{\"content\":\"slow down\",\"importance\":1.7},{\"content\":\"ask more\"}]\n```";
        let parsed = parse_reflections(out, 0.8);
        assert_eq!(
            parsed,
            vec![("slow down".to_string(), 1.0), ("ask more".to_string(), 0.8)]
        );
    }

    #[test]
    fn free_text_becomes_one_reflection() {
        let parsed = parse_reflections("I should listen before advising.", 0.8);
        assert_eq!(parsed, vec![("I should listen before advising.".to_string(), 0.8)]);
        assert!(parse_reflections("   ", 0.8).is_empty());
    }

    #[test]
    fn entries_without_content_are_skipped() {
        let parsed = parse_reflections(r#"[{"importance":0.3},{"content":"keep notes","importance":-2}]"#, 0.8);
        assert_eq!(parsed, vec![("keep notes".to_string(), 0.0)]);
    }

    #[test]
    fn truncation_keeps_the_end_of_the_transcript() {
        assert_eq!(truncate_chars("héllo wörld", 5), "wörld");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");

        let transcript = "=== intake ===\nhello\n\n=== outcome ===\npatient discharged";
        let kept = truncate_chars(transcript, 18);
        assert_eq!(kept, "patient discharged");
    }

    #[test]
    fn chunks_follow_paragraphs_and_cover_everything() {
        let text = "alpha beta\n\ngamma\n\n\n\ndelta epsilon zeta";
        let chunks = chunk_document(text, 17);
        assert_eq!(chunks, vec!["alpha beta\n\ngamma", "delta epsilon zet", "a"]);

        let joined: String = chunks.concat();
        for word in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            assert!(joined.contains(word));
        }
        assert!(chunk_document("  \n\n ", 10).is_empty());
    }

    #[test]
    fn fence_stripping_handles_bare_and_tagged_fences() {
        assert_eq!(strip_json_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fence("```\n[1]\n```"), "[1]");
        assert_eq!(strip_json_fence("  [1]  "), "[1]");
    }
}
