use std::sync::Arc;

use agir_memory::RetrievalCache;
use agir_provider::ModelRouter;
use agir_schema::{Step, StepStatus, User};
use agir_store::Store;
use uuid::Uuid;

use crate::assignment::AgentAssignmentResolver;
use crate::conversation::ConversationRunner;
use crate::error::{EngineError, EngineResult};
use crate::graph::{EpisodeContext, StateNode};

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: Uuid,
    pub output: String,
    pub user_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
}

/// Runs one state of an episode and records it as a step.
pub struct StepExecutor {
    store: Store,
    router: Arc<ModelRouter>,
    cache: Arc<RetrievalCache>,
    assignments: Arc<AgentAssignmentResolver>,
    conversations: ConversationRunner,
    top_k: usize,
}

impl StepExecutor {
    pub fn new(
        store: Store,
        router: Arc<ModelRouter>,
        cache: Arc<RetrievalCache>,
        assignments: Arc<AgentAssignmentResolver>,
        conversations: ConversationRunner,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            router,
            cache,
            assignments,
            conversations,
            top_k,
        }
    }

    pub async fn execute(&self, ctx: &EpisodeContext, node: &StateNode) -> EngineResult<StepOutcome> {
        let step = self
            .store
            .create_step(ctx.episode.id, node.state.id, None)
            .await?;
        tracing::info!(
            episode_id = %ctx.episode.id,
            state = %node.state.name,
            roles = node.roles.len(),
            "step started"
        );

        let mut conversation_id = None;
        let result = match node.roles.as_slice() {
            [] => self.generate(ctx, node, &ctx.learner).await.map(|o| (o, Some(ctx.learner.id))),
            [role] => match self.assignments.resolve(ctx, role).await {
                Ok(user) => self.generate(ctx, node, &user).await.map(|o| (o, Some(user.id))),
                Err(err) => Err(err),
            },
            roles => {
                let mut participants = Vec::with_capacity(roles.len());
                let mut failed = None;
                for role in roles {
                    match self.assignments.resolve(ctx, role).await {
                        Ok(user) => participants.push(user),
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                }
                match failed {
                    Some(err) => Err(err),
                    None => match self.store.create_conversation(ctx.episode.id, node.state.id).await {
                        Ok(conversation) => {
                            conversation_id = Some(conversation.id);
                            self.conversations
                                .run(&conversation, &node.state, &participants)
                                .await
                                .map(|outcome| (outcome.transcript, None))
                        }
                        Err(err) => Err(err.into()),
                    },
                }
            }
        };

        match result {
            Ok((output, user_id)) => {
                self.store
                    .complete_step(step.id, output.clone(), user_id, conversation_id)
                    .await?;
                tracing::info!(
                    episode_id = %ctx.episode.id,
                    state = %node.state.name,
                    "step completed"
                );
                Ok(StepOutcome {
                    step_id: step.id,
                    output,
                    user_id,
                    conversation_id,
                })
            }
            Err(err) => {
                if let Err(store_err) = self
                    .store
                    .fail_step(step.id, err.to_string(), conversation_id)
                    .await
                {
                    tracing::error!(step = %step.id, "failed to record step failure: {store_err:#}");
                }
                tracing::warn!(
                    episode_id = %ctx.episode.id,
                    state = %node.state.name,
                    "step failed: {err}"
                );
                Err(err)
            }
        }
    }

    async fn generate(&self, ctx: &EpisodeContext, node: &StateNode, user: &User) -> EngineResult<String> {
        let previous = self.previous_outputs(ctx).await?;

        let memories = match self
            .cache
            .retrieve(user.id, &node.state.description, self.top_k)
            .await
        {
            Ok(found) => found.into_iter().map(|m| m.content).collect(),
            Err(err) => {
                tracing::warn!(user = %user.username, "memory retrieval failed: {err:#}");
                Vec::new()
            }
        };

        let prompt = step_prompt(node, user, &previous, &memories);
        tracing::debug!(user = %user.username, model = %user.model, "generating step output");
        self.router
            .generate(&user.model, &prompt)
            .await
            .map_err(EngineError::from)
    }

    /// Completed outputs of this episode so far, oldest first, as `(state name, output)`.
    async fn previous_outputs(&self, ctx: &EpisodeContext) -> EngineResult<Vec<(String, String)>> {
        let steps: Vec<Step> = self.store.episode_steps(ctx.episode.id).await?;
        Ok(steps
            .into_iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| {
                let output = s.output?;
                let name = ctx
                    .graph
                    .state(s.state_id)
                    .map(|n| n.state.name.clone())
                    .unwrap_or_default();
                Some((name, output))
            })
            .collect())
    }
}

fn step_prompt(
    node: &StateNode,
    user: &User,
    previous: &[(String, String)],
    memories: &[String],
) -> String {
    let mut prompt = format!(
        "You are a human working on a scenario called \"{}\". Your role: {}. Task: {}",
        node.state.name, user.username, node.state.description
    );
    if !previous.is_empty() {
        prompt.push_str("\n\nPrevious steps:");
        for (name, output) in previous {
            prompt.push_str(&format!("\n=== {name} ===\n{output}"));
        }
    }
    if !memories.is_empty() {
        prompt.push_str("\n\nRelevant knowledge and memories:");
        for memory in memories {
            prompt.push_str(&format!("\n- {memory}"));
        }
    }
    prompt.push_str(&format!(
        "\n\nPlease respond as {} for the current step.",
        user.username
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_schema::{State, UserKind};

    #[test]
    fn prompt_carries_history_and_memories() {
        let node = StateNode {
            state: State {
                id: Uuid::new_v4(),
                scenario_id: Uuid::new_v4(),
                name: "assessment".into(),
                description: "assess progress".into(),
            },
            roles: Vec::new(),
        };
        let user = User::new("dr_kim", UserKind::Agent, "m");
        let prompt = step_prompt(
            &node,
            &user,
            &[("intake".into(), "patient reports anxiety".into())],
            &["breathing exercises help".into()],
        );
        assert!(prompt.starts_with(
            "You are a human working on a scenario called \"assessment\". Your role: dr_kim. Task: assess progress"
        ));
        assert!(prompt.contains("=== intake ===\npatient reports anxiety"));
        assert!(prompt.contains("Relevant knowledge and memories:\n- breathing exercises help"));
        assert!(prompt.ends_with("Please respond as dr_kim for the current step."));
    }

    #[test]
    fn first_step_prompt_has_no_history_section() {
        let node = StateNode {
            state: State {
                id: Uuid::new_v4(),
                scenario_id: Uuid::new_v4(),
                name: "intake".into(),
                description: "listen".into(),
            },
            roles: Vec::new(),
        };
        let user = User::new("sam", UserKind::Learner, "m");
        let prompt = step_prompt(&node, &user, &[], &[]);
        assert!(!prompt.contains("Previous steps"));
        assert!(!prompt.contains("Relevant knowledge"));
    }
}
