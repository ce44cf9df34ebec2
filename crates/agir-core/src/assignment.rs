use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use agir_provider::ModelRouter;
use agir_schema::{Role, User, UserKind};
use agir_store::Store;
use anyhow::anyhow;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{AssignmentConfig, AssignmentMode};
use crate::error::{EngineError, EngineResult};
use crate::graph::EpisodeContext;
use crate::persona::generate_profile;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CountMismatch {
    pub role_id: Uuid,
    pub user_id: Uuid,
    pub tracked: u32,
    pub persisted: u32,
}

struct CounterState {
    threshold: u32,
    counts: HashMap<(Uuid, Uuid), u32>,
}

/// Assignment counts per `(role, user)`, shared by every episode the engine runs.
pub struct AssignmentCounters {
    state: Mutex<CounterState>,
}

impl AssignmentCounters {
    pub fn new(start_threshold: u32) -> Self {
        Self {
            state: Mutex::new(CounterState {
                threshold: start_threshold.max(1),
                counts: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, CounterState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Persistence(anyhow!("failed to lock assignment counters")))
    }

    /// Replaces tracked counts with the persisted assignment rows.
    pub async fn seed_from_store(&self, store: &Store) -> EngineResult<()> {
        let rows = store.assignment_counts().await?;
        let mut state = self.lock()?;
        state.counts = rows
            .into_iter()
            .map(|row| ((row.role_id, row.user_id), row.count as u32))
            .collect();
        tracing::debug!(pairs = state.counts.len(), "assignment counters seeded");
        Ok(())
    }

    pub fn threshold(&self) -> EngineResult<u32> {
        Ok(self.lock()?.threshold)
    }

    pub fn count(&self, role_id: Uuid, user_id: Uuid) -> EngineResult<u32> {
        Ok(self
            .lock()?
            .counts
            .get(&(role_id, user_id))
            .copied()
            .unwrap_or(0))
    }

    /// Picks the least-assigned candidate for `role_id` and counts the
    /// assignment. When every candidate has reached the threshold, the
    /// threshold rises first. Equal counts go to the earliest candidate.
    pub fn select(&self, role_id: Uuid, candidates: &[Uuid]) -> EngineResult<Option<Uuid>> {
        let mut state = self.lock()?;
        let counts: Vec<u32> = candidates
            .iter()
            .map(|user| state.counts.get(&(role_id, *user)).copied().unwrap_or(0))
            .collect();

        let Some(&min) = counts.iter().min() else {
            return Ok(None);
        };
        while min >= state.threshold {
            state.threshold += 1;
            tracing::debug!(threshold = state.threshold, "assignment threshold raised");
        }

        let chosen = counts
            .iter()
            .position(|&count| count == min)
            .map(|i| candidates[i]);
        if let Some(user) = chosen {
            *state.counts.entry((role_id, user)).or_insert(0) += 1;
        }
        Ok(chosen)
    }

    pub fn record(&self, role_id: Uuid, user_id: Uuid) -> EngineResult<()> {
        *self.lock()?.counts.entry((role_id, user_id)).or_insert(0) += 1;
        Ok(())
    }

    /// Undoes a `select` whose assignment never reached the store.
    pub fn release(&self, role_id: Uuid, user_id: Uuid) -> EngineResult<()> {
        let mut state = self.lock()?;
        if let Some(count) = state.counts.get_mut(&(role_id, user_id)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.counts.remove(&(role_id, user_id));
            }
        }
        Ok(())
    }

    /// Tracked counts that disagree with the persisted rows. Empty when consistent.
    pub async fn validate(&self, store: &Store) -> EngineResult<Vec<CountMismatch>> {
        let persisted: HashMap<(Uuid, Uuid), u32> = store
            .assignment_counts()
            .await?
            .into_iter()
            .map(|row| ((row.role_id, row.user_id), row.count as u32))
            .collect();
        let state = self.lock()?;

        let keys: HashSet<(Uuid, Uuid)> = persisted
            .keys()
            .chain(state.counts.keys())
            .copied()
            .collect();
        let mut mismatches: Vec<CountMismatch> = keys
            .into_iter()
            .filter_map(|(role_id, user_id)| {
                let tracked = state.counts.get(&(role_id, user_id)).copied().unwrap_or(0);
                let stored = persisted.get(&(role_id, user_id)).copied().unwrap_or(0);
                (tracked != stored).then_some(CountMismatch {
                    role_id,
                    user_id,
                    tracked,
                    persisted: stored,
                })
            })
            .collect();
        mismatches.sort_by_key(|m| (m.role_id, m.user_id));
        Ok(mismatches)
    }
}

/// Decides which user plays a role in an episode.
pub struct AgentAssignmentResolver {
    store: Store,
    router: Arc<ModelRouter>,
    counters: Arc<AssignmentCounters>,
    config: AssignmentConfig,
    default_model: String,
    /// Serializes single-mode picks so two episodes never claim the same user.
    single_pick: tokio::sync::Mutex<()>,
}

impl AgentAssignmentResolver {
    pub fn new(
        store: Store,
        router: Arc<ModelRouter>,
        counters: Arc<AssignmentCounters>,
        config: AssignmentConfig,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            router,
            counters,
            config,
            default_model: default_model.into(),
            single_pick: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the user bound to `role` in this episode, binding one first if needed.
    pub async fn resolve(&self, ctx: &EpisodeContext, role: &Role) -> EngineResult<User> {
        let episode_id = ctx.episode.id;
        if let Some(existing) = self.store.find_assignment(role.id, episode_id).await? {
            return self
                .store
                .get_user(existing.user_id)
                .await?
                .ok_or_else(|| EngineError::not_found("user", existing.user_id));
        }

        if ctx.graph.is_learner_role(role) {
            return self.bind(ctx, role, ctx.learner.clone(), false).await;
        }

        match self.config.mode {
            AssignmentMode::Single => {
                let _guard = self.single_pick.lock().await;
                let user = self.pick_single(ctx, role).await?;
                self.bind(ctx, role, user, false).await
            }
            AssignmentMode::Multi => {
                let pool = self.multi_pool(ctx, role).await?;
                let ids: Vec<Uuid> = pool.iter().map(|u| u.id).collect();
                let chosen = self
                    .counters
                    .select(role.id, &ids)?
                    .ok_or_else(|| EngineError::NoCandidate {
                        role: role.name.clone(),
                    })?;
                let user = pool
                    .into_iter()
                    .find(|u| u.id == chosen)
                    .ok_or_else(|| EngineError::NoCandidate {
                        role: role.name.clone(),
                    })?;
                self.bind(ctx, role, user, true).await
            }
        }
    }

    /// Persists the binding. `counted` means `select` already bumped the counter.
    async fn bind(
        &self,
        ctx: &EpisodeContext,
        role: &Role,
        user: User,
        counted: bool,
    ) -> EngineResult<User> {
        let result = self
            .store
            .create_assignment(role.id, ctx.episode.id, user.id)
            .await;
        let (assignment, created) = match result {
            Ok(pair) => pair,
            Err(err) => {
                if counted {
                    self.counters.release(role.id, user.id)?;
                }
                return Err(err.into());
            }
        };

        if !created {
            if counted {
                self.counters.release(role.id, user.id)?;
            }
            return self
                .store
                .get_user(assignment.user_id)
                .await?
                .ok_or_else(|| EngineError::not_found("user", assignment.user_id));
        }

        if !counted {
            self.counters.record(role.id, user.id)?;
        }
        tracing::info!(
            episode_id = %ctx.episode.id,
            role = %role.name,
            user = %user.username,
            "agent assigned"
        );
        Ok(user)
    }

    fn is_excluded(&self, ctx: &EpisodeContext, user: &User) -> bool {
        user.id == ctx.learner.id || self.config.excluded_usernames.contains(&user.username)
    }

    /// A user who has played a role of this name elsewhere but not this role
    /// in this scenario, or a fresh one.
    async fn pick_single(&self, ctx: &EpisodeContext, role: &Role) -> EngineResult<User> {
        let bound_here: HashSet<Uuid> = self
            .store
            .role_assignments(role.id)
            .await?
            .into_iter()
            .map(|a| a.user_id)
            .collect();

        let reusable = self
            .store
            .users_with_role_name(&role.name)
            .await?
            .into_iter()
            .find(|u| !bound_here.contains(&u.id) && !self.is_excluded(ctx, u));
        if let Some(user) = reusable {
            return Ok(user);
        }

        self.create_agent(ctx, role).await
    }

    /// Agents eligible for `role` in multi mode.
    async fn multi_pool(&self, ctx: &EpisodeContext, role: &Role) -> EngineResult<Vec<User>> {
        let agents: Vec<User> = self
            .store
            .list_users(Some(UserKind::Agent))
            .await?
            .into_iter()
            .filter(|u| !self.is_excluded(ctx, u))
            .collect();

        let busy: HashSet<Uuid> = self
            .store
            .episode_assignments(ctx.episode.id)
            .await?
            .into_iter()
            .filter(|a| a.role_id != role.id)
            .map(|a| a.user_id)
            .collect();
        let free: Vec<User> = agents
            .iter()
            .filter(|u| !busy.contains(&u.id))
            .cloned()
            .collect();

        let pool = if free.is_empty() { agents } else { free };
        if pool.is_empty() {
            return Ok(vec![self.create_agent(ctx, role).await?]);
        }
        Ok(pool)
    }

    /// A new agent for `role`, named by its own model. The username stays keyed
    /// on role and episode so a retried creation finds the same row.
    async fn create_agent(&self, ctx: &EpisodeContext, role: &Role) -> EngineResult<User> {
        let username = agent_username(&role.name, ctx.episode.id);
        if let Some(existing) = self.store.find_user_by_username(&username).await? {
            return Ok(existing);
        }

        let model = role
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let seed = Uuid::from_u128(ctx.episode.id.as_u128() ^ role.id.as_u128());
        let profile = generate_profile(
            &self.router,
            &model,
            role,
            &ctx.graph.scenario.description,
            seed,
        )
        .await;
        let user = User::new(username, UserKind::Agent, model).with_profile(profile);
        let user = self.store.find_or_create_user(user).await?;
        tracing::info!(
            role = %role.name,
            user = %user.username,
            name = %user.display_name(),
            "created agent user"
        );
        Ok(user)
    }
}

fn agent_username(role_name: &str, episode_id: Uuid) -> String {
    let episode = episode_id.simple().to_string();
    format!(
        "{}_{}",
        role_name.trim().to_lowercase().replace(char::is_whitespace, "_"),
        &episode[..8]
    )
}
