use std::sync::Arc;

use agir_schema::{EpisodeStatus, Memory};
use agir_store::Store;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::graph::{EpisodeContext, ScenarioGraph};
use crate::step::StepExecutor;
use crate::synthesis::MemorySynthesizer;
use crate::transition::{TransitionDecision, TransitionResolver};

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeResult {
    pub episode_id: Uuid,
    pub status: EpisodeStatus,
    pub steps: usize,
    pub last_completed_state_id: Option<Uuid>,
    pub decisions: Vec<TransitionDecision>,
    pub memories: Vec<Memory>,
    /// Set when the episode completed but synthesis did not.
    pub synthesis_error: Option<String>,
    pub error: Option<String>,
}

impl EpisodeResult {
    pub fn fallbacks(&self) -> usize {
        self.decisions.iter().filter(|d| d.fallback_used()).count()
    }
}

/// Per-episode control loop: initial state, steps and transitions until a
/// terminal state, then synthesis.
pub struct EpisodeDriver {
    store: Store,
    executor: StepExecutor,
    transitions: TransitionResolver,
    synthesizer: Arc<MemorySynthesizer>,
    judge_model: Option<String>,
    max_steps: usize,
}

impl EpisodeDriver {
    pub fn new(
        store: Store,
        executor: StepExecutor,
        transitions: TransitionResolver,
        synthesizer: Arc<MemorySynthesizer>,
        judge_model: Option<String>,
        max_steps: usize,
    ) -> Self {
        Self {
            store,
            executor,
            transitions,
            synthesizer,
            judge_model,
            max_steps,
        }
    }

    /// Runs one episode to COMPLETED or FAILED. Errors are returned only when
    /// no episode record could be created; every later failure is reported
    /// through a FAILED result.
    pub async fn run_episode(
        &self,
        scenario_id: Uuid,
        learner_id: Uuid,
        cancel: &CancellationToken,
    ) -> EngineResult<EpisodeResult> {
        self.store
            .get_scenario(scenario_id)
            .await?
            .ok_or_else(|| EngineError::not_found("scenario", scenario_id))?;
        let learner = self
            .store
            .get_user(learner_id)
            .await?
            .ok_or_else(|| EngineError::not_found("user", learner_id))?;

        let episode = self.store.create_episode(scenario_id, learner_id).await?;
        let mut result = EpisodeResult {
            episode_id: episode.id,
            status: EpisodeStatus::Running,
            steps: 0,
            last_completed_state_id: None,
            decisions: Vec::new(),
            memories: Vec::new(),
            synthesis_error: None,
            error: None,
        };
        tracing::info!(episode_id = %episode.id, learner = %learner.username, "episode started");

        let graph = match ScenarioGraph::load(&self.store, scenario_id).await {
            Ok(graph) => Arc::new(graph),
            Err(err) => return self.fail(result, err).await,
        };
        let judge_model = self
            .judge_model
            .clone()
            .unwrap_or_else(|| learner.model.clone());
        let ctx = EpisodeContext {
            episode,
            learner,
            graph,
        };

        let mut current = ctx.graph.initial_state().state.id;
        loop {
            if cancel.is_cancelled() {
                return self.fail(result, EngineError::Cancelled).await;
            }
            if result.steps >= self.max_steps {
                let err = EngineError::Construction(format!(
                    "episode exceeded {} steps without reaching a terminal state",
                    self.max_steps
                ));
                return self.fail(result, err).await;
            }

            let Some(node) = ctx.graph.state(current) else {
                let err = EngineError::Construction(format!("state {current} is not in the graph"));
                return self.fail(result, err).await;
            };
            if let Err(err) = self.store.set_current_state(ctx.episode.id, current).await {
                return self.fail(result, err.into()).await;
            }

            let outcome = match self.executor.execute(&ctx, node).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    result.steps += 1;
                    return self.fail(result, err).await;
                }
            };
            result.steps += 1;

            if let Err(err) = self.store.mark_state_completed(ctx.episode.id, current).await {
                return self.fail(result, err.into()).await;
            }
            result.last_completed_state_id = Some(current);

            let decision = match self
                .transitions
                .resolve_next(&node.state, &outcome.output, &judge_model)
                .await
            {
                Ok(decision) => decision,
                Err(err) => return self.fail(result, err).await,
            };
            let next = decision.next_state_id;
            result.decisions.push(decision);
            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        self.store
            .finish_episode(ctx.episode.id, EpisodeStatus::Completed, None)
            .await?;
        result.status = EpisodeStatus::Completed;
        tracing::info!(
            episode_id = %ctx.episode.id,
            steps = result.steps,
            fallbacks = result.fallbacks(),
            "episode completed"
        );

        match self.synthesizer.synthesize(ctx.episode.id).await {
            Ok(memories) => result.memories = memories,
            Err(err) => {
                tracing::error!(episode_id = %ctx.episode.id, "memory synthesis failed: {err}");
                result.synthesis_error = Some(err.to_string());
            }
        }
        Ok(result)
    }

    /// Runs `count` independent episodes, at most `concurrency` at a time.
    /// Results arrive in completion order.
    pub async fn run_episodes(
        &self,
        scenario_id: Uuid,
        learner_id: Uuid,
        count: usize,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<EngineResult<EpisodeResult>> {
        stream::iter(0..count)
            .map(|_| self.run_episode(scenario_id, learner_id, cancel))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    async fn fail(&self, mut result: EpisodeResult, err: EngineError) -> EngineResult<EpisodeResult> {
        let message = err.to_string();
        self.store
            .finish_episode(result.episode_id, EpisodeStatus::Failed, Some(message.clone()))
            .await?;
        tracing::warn!(episode_id = %result.episode_id, steps = result.steps, "episode failed: {message}");
        result.status = EpisodeStatus::Failed;
        result.error = Some(message);
        Ok(result)
    }
}
