use std::collections::HashSet;
use std::sync::Arc;

use agir_provider::{LlmMessage, ModelRouter};
use agir_schema::{Conversation, Message, State, User};
use agir_store::Store;

use crate::config::ConversationConfig;
use crate::error::EngineResult;

pub const CLOSING_MESSAGE: &str =
    "We've had an extensive discussion. Let's conclude this conversation.";

#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    pub transcript: String,
    pub turns: usize,
    pub concluded: bool,
}

/// Round-robin multi-agent conversation with a bounded number of model turns.
pub struct ConversationRunner {
    store: Store,
    router: Arc<ModelRouter>,
    config: ConversationConfig,
}

impl ConversationRunner {
    pub fn new(store: Store, router: Arc<ModelRouter>, config: ConversationConfig) -> Self {
        Self {
            store,
            router,
            config,
        }
    }

    pub async fn run(
        &self,
        conversation: &Conversation,
        state: &State,
        participants: &[User],
    ) -> EngineResult<ConversationOutcome> {
        // A user bound to several roles speaks once per round.
        let mut seen = HashSet::new();
        let participants: Vec<&User> = participants.iter().filter(|p| seen.insert(p.id)).collect();
        let Some(&opener) = participants.first() else {
            return Ok(ConversationOutcome {
                transcript: String::new(),
                turns: 0,
                concluded: false,
            });
        };

        let mut history: Vec<Message> = Vec::new();
        let opening = format!(
            "Let's start our discussion about: {}. As {}, I'll begin.",
            state.description.trim_end_matches('.'),
            opener.username
        );
        history.push(
            self.store
                .append_message(conversation.id, opener.id, opening)
                .await?,
        );

        let mut turns = 0;
        let mut concluded = false;
        while turns < self.config.max_turns {
            let speaker = participants[(turns + 1) % participants.len()];
            let system = self.system_prompt(state, speaker, &participants);
            let messages = self.window(&history, speaker);

            let response = self
                .router
                .chat(&speaker.model, Some(system), messages, None, None)
                .await?;
            turns += 1;

            let text = response.text.trim().to_string();
            concluded = text.contains(&self.config.conclusion_marker);
            history.push(
                self.store
                    .append_message(conversation.id, speaker.id, text)
                    .await?,
            );
            tracing::debug!(
                conversation = %conversation.id,
                speaker = %speaker.username,
                turn = turns,
                "conversation turn"
            );
            if concluded {
                break;
            }
        }

        if !concluded {
            history.push(
                self.store
                    .append_message(conversation.id, opener.id, CLOSING_MESSAGE.to_string())
                    .await?,
            );
        }

        let messages = self.store.conversation_messages(conversation.id).await?;
        tracing::info!(
            state = %state.name,
            turns,
            concluded,
            "conversation finished"
        );
        Ok(ConversationOutcome {
            transcript: render_transcript(&messages),
            turns,
            concluded,
        })
    }

    fn system_prompt(&self, state: &State, speaker: &User, participants: &[&User]) -> String {
        let others: Vec<&str> = participants
            .iter()
            .filter(|p| p.id != speaker.id)
            .map(|p| p.username.as_str())
            .collect();
        let mut prompt = format!(
            "You are {} taking part in a conversation called \"{}\". Topic: {}",
            speaker.username, state.name, state.description
        );
        if !speaker.profile.description.is_empty() {
            prompt.push_str(&format!("\nYour background: {}", speaker.profile.description));
        }
        if !others.is_empty() {
            prompt.push_str(&format!("\nYou are talking with: {}.", others.join(", ")));
        }
        prompt.push_str(&format!(
            "\nStay in character and reply with your next message only. When the discussion has reached its natural end, include the exact phrase \"{}\".",
            self.config.conclusion_marker
        ));
        prompt
    }

    /// The last `history_window` messages, the speaker's own as assistant turns
    /// and everyone else's prefixed with their name. Always ends on a user turn.
    fn window(&self, history: &[Message], speaker: &User) -> Vec<LlmMessage> {
        let start = history.len().saturating_sub(self.config.history_window.max(1));
        let mut messages: Vec<LlmMessage> = history[start..]
            .iter()
            .map(|m| {
                if m.sender_id == speaker.id {
                    LlmMessage::assistant(m.content.clone())
                } else {
                    LlmMessage::user(format!("{}: {}", m.sender_name, m.content))
                }
            })
            .collect();
        if messages.last().is_none_or(|m| m.role == "assistant") {
            messages.push(LlmMessage::user(format!(
                "Continue the discussion as {}.",
                speaker.username
            )));
        }
        messages
    }
}

pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.sender_name, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_provider::{LlmProvider, LlmRequest, LlmResponse, ProviderRegistry, RouterOptions};
    use agir_schema::{Scenario, UserKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Concludes on the given call number (1-based), chats otherwise.
    struct Talker {
        calls: AtomicUsize,
        conclude_on: usize,
    }

    #[async_trait]
    impl LlmProvider for Talker {
        async fn chat(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(request.system.is_some());
            assert_eq!(request.messages.last().map(|m| m.role.as_str()), Some("user"));
            let text = if n == self.conclude_on {
                "Agreed. I THINK WE'VE REACHED A CONCLUSION".to_string()
            } else {
                format!("point number {n}")
            };
            Ok(LlmResponse {
                text,
                input_tokens: None,
                output_tokens: None,
                stop_reason: None,
            })
        }
    }

    async fn fixture(conclude_on: usize, max_turns: usize) -> (Store, ConversationRunner, Conversation, State, Vec<User>) {
        let store = Store::open_in_memory().unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(
            "talk",
            Arc::new(Talker {
                calls: AtomicUsize::new(0),
                conclude_on,
            }),
        );
        let router = Arc::new(ModelRouter::new(
            registry,
            HashMap::new(),
            RouterOptions::default(),
        ));

        let scenario = store
            .find_or_create_scenario(Scenario {
                id: Uuid::new_v4(),
                name: "ward".into(),
                description: String::new(),
                learner_role: None,
                objective: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let state = store
            .find_or_create_state(State {
                id: Uuid::new_v4(),
                scenario_id: scenario.id,
                name: "handover".into(),
                description: "the night shift handover.".into(),
            })
            .await
            .unwrap();
        let learner = store
            .find_or_create_user(User::new("learner", UserKind::Learner, "talk/x"))
            .await
            .unwrap();
        let episode = store.create_episode(scenario.id, learner.id).await.unwrap();
        let conversation = store.create_conversation(episode.id, state.id).await.unwrap();

        let mut users = Vec::new();
        for name in ["nurse", "doctor"] {
            users.push(
                store
                    .find_or_create_user(User::new(name, UserKind::Agent, "talk/x"))
                    .await
                    .unwrap(),
            );
        }

        let runner = ConversationRunner::new(
            store.clone(),
            router,
            ConversationConfig {
                max_turns,
                ..Default::default()
            },
        );
        (store, runner, conversation, state, users)
    }

    #[tokio::test]
    async fn stops_at_conclusion_marker() {
        let (store, runner, conversation, state, users) = fixture(3, 10).await;
        let outcome = runner.run(&conversation, &state, &users).await.unwrap();

        assert!(outcome.concluded);
        assert_eq!(outcome.turns, 3);
        let messages = store.conversation_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[0].content,
            "Let's start our discussion about: the night shift handover. As nurse, I'll begin."
        );
        assert_eq!(messages[1].sender_name, "doctor");
        assert_eq!(messages[2].sender_name, "nurse");
        assert!(outcome.transcript.starts_with("nurse: Let's start"));
    }

    #[tokio::test]
    async fn a_user_holding_two_roles_speaks_once_per_round() {
        let (store, runner, conversation, state, users) = fixture(usize::MAX, 3).await;
        let (nurse, doctor) = (users[0].clone(), users[1].clone());
        let outcome = runner
            .run(&conversation, &state, &[nurse.clone(), nurse.clone(), doctor])
            .await
            .unwrap();

        assert_eq!(outcome.turns, 3);
        let senders: Vec<String> = store
            .conversation_messages(conversation.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.sender_name)
            .collect();
        assert_eq!(senders, vec!["nurse", "doctor", "nurse", "doctor", "nurse"]);
    }

    #[tokio::test]
    async fn lone_speaker_is_prompted_with_a_user_turn() {
        let (store, runner, conversation, state, users) = fixture(usize::MAX, 2).await;
        let nurse = users[0].clone();
        let outcome = runner
            .run(&conversation, &state, &[nurse.clone(), nurse])
            .await
            .unwrap();
        assert_eq!(outcome.turns, 2);
        assert_eq!(store.conversation_messages(conversation.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn appends_closing_message_at_turn_limit() {
        let (store, runner, conversation, state, users) = fixture(usize::MAX, 2).await;
        let outcome = runner.run(&conversation, &state, &users).await.unwrap();

        assert!(!outcome.concluded);
        assert_eq!(outcome.turns, 2);
        let messages = store.conversation_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].content, CLOSING_MESSAGE);
        assert_eq!(messages[3].sender_name, "nurse");
    }
}
