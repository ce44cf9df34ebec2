use crate::migrations::run_migrations;
use agir_schema::{
    AgentAssignment, Conversation, Episode, EpisodeStatus, Memory, Message, Role, Scenario, State,
    Step, StepStatus, Transition, User, UserKind, UserProfile, MEMORY_SOURCE_EPISODE,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task;
use uuid::Uuid;

const USER_SELECT: &str = "SELECT id, username, kind, first_name, last_name, description, model, created_at FROM users";
const SCENARIO_SELECT: &str =
    "SELECT id, name, description, learner_role, objective, created_at FROM scenarios";
const ROLE_SELECT: &str = "SELECT id, scenario_id, name, description, model FROM roles";
const STATE_SELECT: &str = "SELECT id, scenario_id, name, description FROM states";
const TRANSITION_SELECT: &str =
    "SELECT id, scenario_id, from_state_id, to_state_id, condition FROM transitions";
const EPISODE_SELECT: &str = "SELECT id, scenario_id, learner_id, status, current_state_id, last_completed_state_id, error, created_at, updated_at FROM episodes";
const ASSIGNMENT_SELECT: &str =
    "SELECT id, role_id, episode_id, user_id, created_at FROM agent_assignments";
const STEP_SELECT: &str = "SELECT id, episode_id, state_id, user_id, status, output, conversation_id, started_at, finished_at FROM steps";
const MEMORY_SELECT: &str = "SELECT id, user_id, content, importance, source, episode_id, scenario_id, document, access_count, last_accessed, created_at FROM memories";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingCacheStat {
    pub namespace: String,
    pub entries: i64,
    pub last_written: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOrder {
    Recency,
    Importance,
}

/// Number of persisted assignments binding `user_id` to `role_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentCount {
    pub role_id: Uuid,
    pub user_id: Uuid,
    pub count: i64,
}

/// SQLite-backed persistence for scenario graphs, runtime records and memories.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            f(&conn)
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Returns the user with `user.username`, inserting `user` if there is none.
    pub async fn find_or_create_user(&self, user: User) -> Result<User> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO users (
                    id, username, kind, first_name, last_name, description, model, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    user.id.to_string(),
                    user.username,
                    user_kind_as_str(user.kind),
                    user.profile.first_name,
                    user.profile.last_name,
                    user.profile.description,
                    user.model,
                    user.created_at.to_rfc3339(),
                ],
            )?;
            let found = conn.query_row(
                &format!("{USER_SELECT} WHERE username = ?1"),
                params![user.username],
                row_to_user,
            )?;
            Ok(found)
        })
        .await
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(move |conn| {
            let user = conn
                .query_row(
                    &format!("{USER_SELECT} WHERE id = ?1"),
                    params![id.to_string()],
                    row_to_user,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            let user = conn
                .query_row(
                    &format!("{USER_SELECT} WHERE username = ?1"),
                    params![username],
                    row_to_user,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    /// Users in creation order, optionally restricted to one kind.
    pub async fn list_users(&self, kind: Option<UserKind>) -> Result<Vec<User>> {
        self.with_conn(move |conn| {
            let kind = kind.map(user_kind_as_str);
            let mut stmt = conn.prepare(&format!(
                "{USER_SELECT} WHERE (?1 IS NULL OR kind = ?1) ORDER BY rowid"
            ))?;
            let rows = stmt.query_map(params![kind], row_to_user)?;
            let users = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    /// Overwrites the profile and model of an existing user.
    pub async fn update_user_profile(
        &self,
        id: Uuid,
        profile: UserProfile,
        model: String,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET first_name = ?2, last_name = ?3, description = ?4, model = ?5 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    profile.first_name,
                    profile.last_name,
                    profile.description,
                    model
                ],
            )?;
            if changed == 0 {
                anyhow::bail!("user {id} not found");
            }
            Ok(())
        })
        .await
    }

    /// Agent users that have played a role called `role_name` in any scenario,
    /// ordered by their first such assignment.
    pub async fn users_with_role_name(&self, role_name: &str) -> Result<Vec<User>> {
        let role_name = role_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT u.id, u.username, u.kind, u.first_name, u.last_name, u.description,
                       u.model, u.created_at
                FROM users u
                JOIN agent_assignments a ON a.user_id = u.id
                JOIN roles r ON r.id = a.role_id
                WHERE r.name = ?1 AND u.kind = 'agent'
                GROUP BY u.id
                ORDER BY MIN(a.rowid)
                "#,
            )?;
            let rows = stmt.query_map(params![role_name], row_to_user)?;
            let users = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Scenario graph
    // ------------------------------------------------------------------

    /// Returns the scenario named `scenario.name`, inserting it if absent.
    pub async fn find_or_create_scenario(&self, scenario: Scenario) -> Result<Scenario> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO scenarios (
                    id, name, description, learner_role, objective, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    scenario.id.to_string(),
                    scenario.name,
                    scenario.description,
                    scenario.learner_role,
                    scenario.objective,
                    scenario.created_at.to_rfc3339(),
                ],
            )?;
            let found = conn.query_row(
                &format!("{SCENARIO_SELECT} WHERE name = ?1"),
                params![scenario.name],
                row_to_scenario,
            )?;
            Ok(found)
        })
        .await
    }

    pub async fn get_scenario(&self, id: Uuid) -> Result<Option<Scenario>> {
        self.with_conn(move |conn| {
            let scenario = conn
                .query_row(
                    &format!("{SCENARIO_SELECT} WHERE id = ?1"),
                    params![id.to_string()],
                    row_to_scenario,
                )
                .optional()?;
            Ok(scenario)
        })
        .await
    }

    pub async fn find_scenario_by_name(&self, name: &str) -> Result<Option<Scenario>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let scenario = conn
                .query_row(
                    &format!("{SCENARIO_SELECT} WHERE name = ?1"),
                    params![name],
                    row_to_scenario,
                )
                .optional()?;
            Ok(scenario)
        })
        .await
    }

    pub async fn find_or_create_role(&self, role: Role) -> Result<Role> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO roles (id, scenario_id, name, description, model)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    role.id.to_string(),
                    role.scenario_id.to_string(),
                    role.name,
                    role.description,
                    role.model,
                ],
            )?;
            let found = conn.query_row(
                &format!("{ROLE_SELECT} WHERE scenario_id = ?1 AND name = ?2"),
                params![role.scenario_id.to_string(), role.name],
                row_to_role,
            )?;
            Ok(found)
        })
        .await
    }

    pub async fn scenario_roles(&self, scenario_id: Uuid) -> Result<Vec<Role>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{ROLE_SELECT} WHERE scenario_id = ?1 ORDER BY rowid"))?;
            let rows = stmt.query_map(params![scenario_id.to_string()], row_to_role)?;
            let roles = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(roles)
        })
        .await
    }

    pub async fn find_or_create_state(&self, state: State) -> Result<State> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO states (id, scenario_id, name, description)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    state.id.to_string(),
                    state.scenario_id.to_string(),
                    state.name,
                    state.description,
                ],
            )?;
            let found = conn.query_row(
                &format!("{STATE_SELECT} WHERE scenario_id = ?1 AND name = ?2"),
                params![state.scenario_id.to_string(), state.name],
                row_to_state,
            )?;
            Ok(found)
        })
        .await
    }

    pub async fn scenario_states(&self, scenario_id: Uuid) -> Result<Vec<State>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{STATE_SELECT} WHERE scenario_id = ?1 ORDER BY rowid"))?;
            let rows = stmt.query_map(params![scenario_id.to_string()], row_to_state)?;
            let states = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(states)
        })
        .await
    }

    pub async fn attach_role_to_state(
        &self,
        state_id: Uuid,
        role_id: Uuid,
        position: i64,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO state_roles (state_id, role_id, position) VALUES (?1, ?2, ?3)",
                params![state_id.to_string(), role_id.to_string(), position],
            )?;
            Ok(())
        })
        .await
    }

    /// Roles participating in a state, in declaration order.
    pub async fn state_roles(&self, state_id: Uuid) -> Result<Vec<Role>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT r.id, r.scenario_id, r.name, r.description, r.model
                FROM roles r
                JOIN state_roles sr ON sr.role_id = r.id
                WHERE sr.state_id = ?1
                ORDER BY sr.position, r.rowid
                "#,
            )?;
            let rows = stmt.query_map(params![state_id.to_string()], row_to_role)?;
            let roles = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(roles)
        })
        .await
    }

    pub async fn find_or_create_transition(&self, transition: Transition) -> Result<Transition> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO transitions (
                    id, scenario_id, from_state_id, to_state_id, condition
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    transition.id.to_string(),
                    transition.scenario_id.to_string(),
                    transition.from_state_id.to_string(),
                    transition.to_state_id.to_string(),
                    transition.condition,
                ],
            )?;
            let found = conn.query_row(
                &format!(
                    "{TRANSITION_SELECT} WHERE scenario_id = ?1 AND from_state_id = ?2 AND to_state_id = ?3"
                ),
                params![
                    transition.scenario_id.to_string(),
                    transition.from_state_id.to_string(),
                    transition.to_state_id.to_string(),
                ],
                row_to_transition,
            )?;
            Ok(found)
        })
        .await
    }

    pub async fn scenario_transitions(&self, scenario_id: Uuid) -> Result<Vec<Transition>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{TRANSITION_SELECT} WHERE scenario_id = ?1 ORDER BY rowid"
            ))?;
            let rows = stmt.query_map(params![scenario_id.to_string()], row_to_transition)?;
            let transitions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(transitions)
        })
        .await
    }

    /// Outgoing transitions of a state in the order they were declared.
    pub async fn transitions_from(&self, state_id: Uuid) -> Result<Vec<Transition>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{TRANSITION_SELECT} WHERE from_state_id = ?1 ORDER BY rowid"
            ))?;
            let rows = stmt.query_map(params![state_id.to_string()], row_to_transition)?;
            let transitions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(transitions)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    pub async fn create_episode(&self, scenario_id: Uuid, learner_id: Uuid) -> Result<Episode> {
        let now = Utc::now();
        let episode = Episode {
            id: Uuid::new_v4(),
            scenario_id,
            learner_id,
            status: EpisodeStatus::Running,
            current_state_id: None,
            last_completed_state_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let record = episode.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO episodes (
                    id, scenario_id, learner_id, status, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.id.to_string(),
                    record.scenario_id.to_string(),
                    record.learner_id.to_string(),
                    episode_status_as_str(record.status),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(episode)
    }

    pub async fn get_episode(&self, id: Uuid) -> Result<Option<Episode>> {
        self.with_conn(move |conn| {
            let episode = conn
                .query_row(
                    &format!("{EPISODE_SELECT} WHERE id = ?1"),
                    params![id.to_string()],
                    row_to_episode,
                )
                .optional()?;
            Ok(episode)
        })
        .await
    }

    pub async fn set_current_state(&self, episode_id: Uuid, state_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE episodes SET current_state_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    episode_id.to_string(),
                    state_id.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_state_completed(&self, episode_id: Uuid, state_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE episodes SET last_completed_state_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    episode_id.to_string(),
                    state_id.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Moves a running episode to a terminal status. Terminal episodes are left untouched.
    pub async fn finish_episode(
        &self,
        episode_id: Uuid,
        status: EpisodeStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                UPDATE episodes SET status = ?2, error = ?3, updated_at = ?4
                WHERE id = ?1 AND status = 'RUNNING'
                "#,
                params![
                    episode_id.to_string(),
                    episode_status_as_str(status),
                    error,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    pub async fn find_assignment(
        &self,
        role_id: Uuid,
        episode_id: Uuid,
    ) -> Result<Option<AgentAssignment>> {
        self.with_conn(move |conn| {
            let assignment = conn
                .query_row(
                    &format!("{ASSIGNMENT_SELECT} WHERE role_id = ?1 AND episode_id = ?2"),
                    params![role_id.to_string(), episode_id.to_string()],
                    row_to_assignment,
                )
                .optional()?;
            Ok(assignment)
        })
        .await
    }

    /// Binds `user_id` to (role, episode) unless a binding already exists.
    /// Returns the persisted binding and whether this call created it.
    pub async fn create_assignment(
        &self,
        role_id: Uuid,
        episode_id: Uuid,
        user_id: Uuid,
    ) -> Result<(AgentAssignment, bool)> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO agent_assignments (id, role_id, episode_id, user_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    role_id.to_string(),
                    episode_id.to_string(),
                    user_id.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )? == 1;
            let assignment = conn.query_row(
                &format!("{ASSIGNMENT_SELECT} WHERE role_id = ?1 AND episode_id = ?2"),
                params![role_id.to_string(), episode_id.to_string()],
                row_to_assignment,
            )?;
            Ok((assignment, inserted))
        })
        .await
    }

    pub async fn episode_assignments(&self, episode_id: Uuid) -> Result<Vec<AgentAssignment>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{ASSIGNMENT_SELECT} WHERE episode_id = ?1 ORDER BY rowid"
            ))?;
            let rows = stmt.query_map(params![episode_id.to_string()], row_to_assignment)?;
            let assignments = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(assignments)
        })
        .await
    }

    pub async fn role_assignments(&self, role_id: Uuid) -> Result<Vec<AgentAssignment>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{ASSIGNMENT_SELECT} WHERE role_id = ?1 ORDER BY rowid"))?;
            let rows = stmt.query_map(params![role_id.to_string()], row_to_assignment)?;
            let assignments = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(assignments)
        })
        .await
    }

    /// Persisted assignment counts per (role, user).
    pub async fn assignment_counts(&self) -> Result<Vec<AssignmentCount>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT role_id, user_id, COUNT(*)
                FROM agent_assignments
                GROUP BY role_id, user_id
                ORDER BY MIN(rowid)
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                let role_raw: String = row.get(0)?;
                let user_raw: String = row.get(1)?;
                Ok(AssignmentCount {
                    role_id: parse_uuid_sql(&role_raw)?,
                    user_id: parse_uuid_sql(&user_raw)?,
                    count: row.get(2)?,
                })
            })?;
            let counts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(counts)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    pub async fn create_step(
        &self,
        episode_id: Uuid,
        state_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Step> {
        let step = Step {
            id: Uuid::new_v4(),
            episode_id,
            state_id,
            user_id,
            status: StepStatus::Running,
            output: None,
            conversation_id: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        let record = step.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO steps (id, episode_id, state_id, user_id, status, started_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.id.to_string(),
                    record.episode_id.to_string(),
                    record.state_id.to_string(),
                    record.user_id.map(|id| id.to_string()),
                    step_status_as_str(record.status),
                    record.started_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(step)
    }

    pub async fn complete_step(
        &self,
        step_id: Uuid,
        output: String,
        user_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                UPDATE steps
                SET status = 'COMPLETED', output = ?2, user_id = COALESCE(?3, user_id),
                    conversation_id = ?4, finished_at = ?5
                WHERE id = ?1
                "#,
                params![
                    step_id.to_string(),
                    output,
                    user_id.map(|id| id.to_string()),
                    conversation_id.map(|id| id.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Marks a step FAILED, keeping the error text in its output field.
    pub async fn fail_step(
        &self,
        step_id: Uuid,
        error: String,
        conversation_id: Option<Uuid>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                UPDATE steps
                SET status = 'FAILED', output = ?2, conversation_id = COALESCE(?3, conversation_id),
                    finished_at = ?4
                WHERE id = ?1
                "#,
                params![
                    step_id.to_string(),
                    error,
                    conversation_id.map(|id| id.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Steps of an episode in execution order.
    pub async fn episode_steps(&self, episode_id: Uuid) -> Result<Vec<Step>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{STEP_SELECT} WHERE episode_id = ?1 ORDER BY rowid"))?;
            let rows = stmt.query_map(params![episode_id.to_string()], row_to_step)?;
            let steps = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(steps)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub async fn create_conversation(
        &self,
        episode_id: Uuid,
        state_id: Uuid,
    ) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            episode_id,
            state_id,
            created_at: Utc::now(),
        };
        let record = conversation.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, episode_id, state_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id.to_string(),
                    record.episode_id.to_string(),
                    record.state_id.to_string(),
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(conversation)
    }

    /// Appends a message at the next sequence position of the conversation.
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> Result<Message> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq) + 1, 0) FROM messages WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )?;
            let sender_name: String = tx.query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![sender_id.to_string()],
                |row| row.get(0),
            )?;
            let message = Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id,
                sender_name,
                content,
                seq,
                created_at: Utc::now(),
            };
            tx.execute(
                r#"
                INSERT INTO messages (id, conversation_id, sender_id, content, seq, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.to_string(),
                    message.content,
                    message.seq,
                    message.created_at.to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok(message)
        })
        .await
    }

    pub async fn conversation_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT m.id, m.conversation_id, m.sender_id, u.username, m.content, m.seq, m.created_at
                FROM messages m
                JOIN users u ON u.id = m.sender_id
                WHERE m.conversation_id = ?1
                ORDER BY m.seq
                "#,
            )?;
            let rows = stmt.query_map(params![conversation_id.to_string()], row_to_message)?;
            let messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Memories
    // ------------------------------------------------------------------

    pub async fn insert_memory(&self, memory: Memory) -> Result<()> {
        self.with_conn(move |conn| {
            insert_memory_row(conn, &memory)?;
            Ok(())
        })
        .await
    }

    /// Writes memories for an episode unless it already has episode-sourced
    /// memories. Returns the episode's memories and whether anything was written.
    pub async fn insert_episode_memories(
        &self,
        episode_id: Uuid,
        memories: Vec<Memory>,
    ) -> Result<(Vec<Memory>, bool)> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let existing = select_episode_memories(&tx, episode_id)?;
            if !existing.is_empty() {
                return Ok((existing, false));
            }
            for memory in &memories {
                insert_memory_row(&tx, memory)?;
            }
            tx.commit()?;
            Ok((memories, true))
        })
        .await
    }

    /// Memories derived from an episode.
    pub async fn episode_memories(&self, episode_id: Uuid) -> Result<Vec<Memory>> {
        self.with_conn(move |conn| select_episode_memories(conn, episode_id))
            .await
    }

    pub async fn user_memories(
        &self,
        user_id: Uuid,
        order: MemoryOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>> {
        self.with_conn(move |conn| {
            let order_by = match order {
                MemoryOrder::Recency => "created_at DESC, rowid DESC",
                MemoryOrder::Importance => "importance DESC, created_at DESC",
            };
            let limit = limit.map(|l| l as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(&format!(
                "{MEMORY_SELECT} WHERE user_id = ?1 ORDER BY {order_by} LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![user_id.to_string(), limit], row_to_memory)?;
            let memories = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(memories)
        })
        .await
    }

    pub async fn count_memories(&self, user_id: Uuid) -> Result<i64> {
        self.with_conn(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    /// Bumps access counters for memories returned by a search and returns
    /// the stored counts after the bump.
    pub async fn record_memory_access(
        &self,
        ids: Vec<Uuid>,
    ) -> Result<HashMap<Uuid, (i64, DateTime<Utc>)>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.with_conn(move |conn| {
            let now = Utc::now();
            let tx = conn.unchecked_transaction()?;
            let mut counts = HashMap::new();
            {
                let mut stmt = tx.prepare(
                    "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2
                     WHERE id = ?1 RETURNING access_count",
                )?;
                for id in ids {
                    let count: Option<i64> = stmt
                        .query_row(params![id.to_string(), now.to_rfc3339()], |row| row.get(0))
                        .optional()?;
                    if let Some(count) = count {
                        counts.insert(id, (count, now));
                    }
                }
            }
            tx.commit()?;
            Ok(counts)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Embedding cache
    // ------------------------------------------------------------------

    /// Cached vectors for `hashes` under `namespace`; misses are absent
    /// from the map.
    pub async fn cached_embeddings(
        &self,
        namespace: &str,
        hashes: Vec<String>,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT vector FROM embedding_cache WHERE namespace = ?1 AND text_hash = ?2",
            )?;
            let mut found = HashMap::new();
            for hash in hashes {
                let blob: Option<Vec<u8>> = stmt
                    .query_row(params![namespace, hash], |row| row.get(0))
                    .optional()?;
                if let Some(blob) = blob {
                    found.insert(hash, decode_vector(&blob)?);
                }
            }
            Ok(found)
        })
        .await
    }

    /// Stores freshly computed vectors in one transaction.
    pub async fn cache_embeddings(
        &self,
        namespace: &str,
        entries: Vec<(String, Vec<f32>)>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO embedding_cache (namespace, text_hash, vector, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (hash, vector) in &entries {
                    stmt.execute(params![namespace, hash, encode_vector(vector), now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Row counts of the persisted embedding cache per namespace.
    pub async fn embedding_cache_stats(&self) -> Result<Vec<EmbeddingCacheStat>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT namespace, COUNT(*), MAX(created_at)
                FROM embedding_cache
                GROUP BY namespace
                ORDER BY namespace
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(EmbeddingCacheStat {
                    namespace: row.get(0)?,
                    entries: row.get(1)?,
                    last_written: row.get(2)?,
                })
            })?;
            let stats = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(stats)
        })
        .await
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(anyhow!("embedding blob of {} bytes is not f32-aligned", blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn insert_memory_row(conn: &Connection, memory: &Memory) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO memories (
            id, user_id, content, importance, source, episode_id, scenario_id, document,
            access_count, last_accessed, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            memory.id.to_string(),
            memory.user_id.to_string(),
            memory.content,
            memory.importance,
            memory.source,
            memory.episode_id.map(|id| id.to_string()),
            memory.scenario_id.map(|id| id.to_string()),
            memory.document,
            memory.access_count,
            memory.last_accessed.map(|ts| ts.to_rfc3339()),
            memory.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn select_episode_memories(conn: &Connection, episode_id: Uuid) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!(
        "{MEMORY_SELECT} WHERE episode_id = ?1 AND source = ?2 ORDER BY rowid"
    ))?;
    let rows = stmt.query_map(
        params![episode_id.to_string(), MEMORY_SOURCE_EPISODE],
        row_to_memory,
    )?;
    let memories = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(memories)
}

fn user_kind_as_str(kind: UserKind) -> &'static str {
    match kind {
        UserKind::Learner => "learner",
        UserKind::Agent => "agent",
    }
}

fn parse_user_kind(s: &str) -> UserKind {
    match s {
        "learner" => UserKind::Learner,
        _ => UserKind::Agent,
    }
}

fn episode_status_as_str(status: EpisodeStatus) -> &'static str {
    match status {
        EpisodeStatus::Running => "RUNNING",
        EpisodeStatus::Completed => "COMPLETED",
        EpisodeStatus::Failed => "FAILED",
    }
}

fn parse_episode_status(s: &str) -> EpisodeStatus {
    match s {
        "RUNNING" => EpisodeStatus::Running,
        "COMPLETED" => EpisodeStatus::Completed,
        _ => EpisodeStatus::Failed,
    }
}

fn step_status_as_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Running => "RUNNING",
        StepStatus::Completed => "COMPLETED",
        StepStatus::Failed => "FAILED",
    }
}

fn parse_step_status(s: &str) -> StepStatus {
    match s {
        "RUNNING" => StepStatus::Running,
        "COMPLETED" => StepStatus::Completed,
        _ => StepStatus::Failed,
    }
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid_sql(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_uuid_sql(raw: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    raw.as_deref().map(parse_uuid_sql).transpose()
}

fn parse_opt_datetime_sql(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_datetime_sql).transpose()
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let id_raw: String = row.get(0)?;
    let kind_raw: String = row.get(2)?;
    let created_raw: String = row.get(7)?;

    Ok(User {
        id: parse_uuid_sql(&id_raw)?,
        username: row.get(1)?,
        kind: parse_user_kind(&kind_raw),
        profile: UserProfile {
            first_name: row.get(3)?,
            last_name: row.get(4)?,
            description: row.get(5)?,
        },
        model: row.get(6)?,
        created_at: parse_datetime_sql(&created_raw)?,
    })
}

fn row_to_scenario(row: &Row<'_>) -> rusqlite::Result<Scenario> {
    let id_raw: String = row.get(0)?;
    let created_raw: String = row.get(5)?;

    Ok(Scenario {
        id: parse_uuid_sql(&id_raw)?,
        name: row.get(1)?,
        description: row.get(2)?,
        learner_role: row.get(3)?,
        objective: row.get(4)?,
        created_at: parse_datetime_sql(&created_raw)?,
    })
}

fn row_to_role(row: &Row<'_>) -> rusqlite::Result<Role> {
    let id_raw: String = row.get(0)?;
    let scenario_raw: String = row.get(1)?;

    Ok(Role {
        id: parse_uuid_sql(&id_raw)?,
        scenario_id: parse_uuid_sql(&scenario_raw)?,
        name: row.get(2)?,
        description: row.get(3)?,
        model: row.get(4)?,
    })
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<State> {
    let id_raw: String = row.get(0)?;
    let scenario_raw: String = row.get(1)?;

    Ok(State {
        id: parse_uuid_sql(&id_raw)?,
        scenario_id: parse_uuid_sql(&scenario_raw)?,
        name: row.get(2)?,
        description: row.get(3)?,
    })
}

fn row_to_transition(row: &Row<'_>) -> rusqlite::Result<Transition> {
    let id_raw: String = row.get(0)?;
    let scenario_raw: String = row.get(1)?;
    let from_raw: String = row.get(2)?;
    let to_raw: String = row.get(3)?;

    Ok(Transition {
        id: parse_uuid_sql(&id_raw)?,
        scenario_id: parse_uuid_sql(&scenario_raw)?,
        from_state_id: parse_uuid_sql(&from_raw)?,
        to_state_id: parse_uuid_sql(&to_raw)?,
        condition: row.get(4)?,
    })
}

fn row_to_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
    let id_raw: String = row.get(0)?;
    let scenario_raw: String = row.get(1)?;
    let learner_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let created_raw: String = row.get(7)?;
    let updated_raw: String = row.get(8)?;

    Ok(Episode {
        id: parse_uuid_sql(&id_raw)?,
        scenario_id: parse_uuid_sql(&scenario_raw)?,
        learner_id: parse_uuid_sql(&learner_raw)?,
        status: parse_episode_status(&status_raw),
        current_state_id: parse_opt_uuid_sql(row.get(4)?)?,
        last_completed_state_id: parse_opt_uuid_sql(row.get(5)?)?,
        error: row.get(6)?,
        created_at: parse_datetime_sql(&created_raw)?,
        updated_at: parse_datetime_sql(&updated_raw)?,
    })
}

fn row_to_assignment(row: &Row<'_>) -> rusqlite::Result<AgentAssignment> {
    let id_raw: String = row.get(0)?;
    let role_raw: String = row.get(1)?;
    let episode_raw: String = row.get(2)?;
    let user_raw: String = row.get(3)?;
    let created_raw: String = row.get(4)?;

    Ok(AgentAssignment {
        id: parse_uuid_sql(&id_raw)?,
        role_id: parse_uuid_sql(&role_raw)?,
        episode_id: parse_uuid_sql(&episode_raw)?,
        user_id: parse_uuid_sql(&user_raw)?,
        created_at: parse_datetime_sql(&created_raw)?,
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<Step> {
    let id_raw: String = row.get(0)?;
    let episode_raw: String = row.get(1)?;
    let state_raw: String = row.get(2)?;
    let status_raw: String = row.get(4)?;
    let started_raw: String = row.get(7)?;

    Ok(Step {
        id: parse_uuid_sql(&id_raw)?,
        episode_id: parse_uuid_sql(&episode_raw)?,
        state_id: parse_uuid_sql(&state_raw)?,
        user_id: parse_opt_uuid_sql(row.get(3)?)?,
        status: parse_step_status(&status_raw),
        output: row.get(5)?,
        conversation_id: parse_opt_uuid_sql(row.get(6)?)?,
        started_at: parse_datetime_sql(&started_raw)?,
        finished_at: parse_opt_datetime_sql(row.get(8)?)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let id_raw: String = row.get(0)?;
    let conversation_raw: String = row.get(1)?;
    let sender_raw: String = row.get(2)?;
    let created_raw: String = row.get(6)?;

    Ok(Message {
        id: parse_uuid_sql(&id_raw)?,
        conversation_id: parse_uuid_sql(&conversation_raw)?,
        sender_id: parse_uuid_sql(&sender_raw)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        seq: row.get(5)?,
        created_at: parse_datetime_sql(&created_raw)?,
    })
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let id_raw: String = row.get(0)?;
    let user_raw: String = row.get(1)?;
    let created_raw: String = row.get(10)?;

    Ok(Memory {
        id: parse_uuid_sql(&id_raw)?,
        user_id: parse_uuid_sql(&user_raw)?,
        content: row.get(2)?,
        importance: row.get(3)?,
        source: row.get(4)?,
        episode_id: parse_opt_uuid_sql(row.get(5)?)?,
        scenario_id: parse_opt_uuid_sql(row.get(6)?)?,
        document: row.get(7)?,
        access_count: row.get(8)?,
        last_accessed: parse_opt_datetime_sql(row.get(9)?)?,
        created_at: parse_datetime_sql(&created_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded_scenario(store: &Store) -> (Scenario, State, State) {
        let scenario = store
            .find_or_create_scenario(Scenario {
                id: Uuid::new_v4(),
                name: "triage".into(),
                description: "ER triage".into(),
                learner_role: None,
                objective: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let a = store
            .find_or_create_state(State {
                id: Uuid::new_v4(),
                scenario_id: scenario.id,
                name: "intake".into(),
                description: "take history".into(),
            })
            .await
            .unwrap();
        let b = store
            .find_or_create_state(State {
                id: Uuid::new_v4(),
                scenario_id: scenario.id,
                name: "plan".into(),
                description: "make a plan".into(),
            })
            .await
            .unwrap();
        (scenario, a, b)
    }

    #[tokio::test]
    async fn find_or_create_is_keyed_by_natural_key() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .find_or_create_user(User::new("alice", UserKind::Learner, "gpt-4o"))
            .await
            .unwrap();
        let second = store
            .find_or_create_user(User::new("alice", UserKind::Agent, "other"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.kind, UserKind::Learner);

        let (scenario, a, b) = seeded_scenario(&store).await;
        let (again, a2, _) = seeded_scenario(&store).await;
        assert_eq!(scenario.id, again.id);
        assert_eq!(a.id, a2.id);

        let t = Transition {
            id: Uuid::new_v4(),
            scenario_id: scenario.id,
            from_state_id: a.id,
            to_state_id: b.id,
            condition: None,
        };
        let t1 = store.find_or_create_transition(t.clone()).await.unwrap();
        let t2 = store
            .find_or_create_transition(Transition {
                id: Uuid::new_v4(),
                ..t
            })
            .await
            .unwrap();
        assert_eq!(t1.id, t2.id);
        assert_eq!(store.scenario_transitions(scenario.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_roles_follow_position() {
        let store = Store::open_in_memory().unwrap();
        let (scenario, a, _) = seeded_scenario(&store).await;
        let mut ids = Vec::new();
        for name in ["nurse", "doctor"] {
            let role = store
                .find_or_create_role(Role {
                    id: Uuid::new_v4(),
                    scenario_id: scenario.id,
                    name: name.into(),
                    description: String::new(),
                    model: None,
                })
                .await
                .unwrap();
            ids.push(role.id);
        }
        store.attach_role_to_state(a.id, ids[1], 0).await.unwrap();
        store.attach_role_to_state(a.id, ids[0], 1).await.unwrap();
        store.attach_role_to_state(a.id, ids[0], 1).await.unwrap();

        let roles = store.state_roles(a.id).await.unwrap();
        let names: Vec<_> = roles.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["doctor", "nurse"]);
    }

    #[tokio::test]
    async fn assignment_is_unique_per_role_and_episode() {
        let store = Store::open_in_memory().unwrap();
        let (scenario, _, _) = seeded_scenario(&store).await;
        let learner = store
            .find_or_create_user(User::new("learner", UserKind::Learner, "m"))
            .await
            .unwrap();
        let u1 = store
            .find_or_create_user(User::new("u1", UserKind::Agent, "m"))
            .await
            .unwrap();
        let u2 = store
            .find_or_create_user(User::new("u2", UserKind::Agent, "m"))
            .await
            .unwrap();
        let role = store
            .find_or_create_role(Role {
                id: Uuid::new_v4(),
                scenario_id: scenario.id,
                name: "nurse".into(),
                description: String::new(),
                model: None,
            })
            .await
            .unwrap();
        let episode = store.create_episode(scenario.id, learner.id).await.unwrap();

        let (first, created) = store.create_assignment(role.id, episode.id, u1.id).await.unwrap();
        assert!(created);
        let (second, created) = store.create_assignment(role.id, episode.id, u2.id).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.user_id, u1.id);

        let counts = store.assignment_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![AssignmentCount {
                role_id: role.id,
                user_id: u1.id,
                count: 1
            }]
        );
        let holders = store.users_with_role_name("nurse").await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].id, u1.id);
    }

    #[tokio::test]
    async fn episode_lifecycle_and_steps() {
        let store = Store::open_in_memory().unwrap();
        let (scenario, a, b) = seeded_scenario(&store).await;
        let learner = store
            .find_or_create_user(User::new("learner", UserKind::Learner, "m"))
            .await
            .unwrap();
        let episode = store.create_episode(scenario.id, learner.id).await.unwrap();

        store.set_current_state(episode.id, a.id).await.unwrap();
        let step = store.create_step(episode.id, a.id, Some(learner.id)).await.unwrap();
        store
            .complete_step(step.id, "done".into(), None, None)
            .await
            .unwrap();
        store.mark_state_completed(episode.id, a.id).await.unwrap();
        store.set_current_state(episode.id, b.id).await.unwrap();
        let failed = store.create_step(episode.id, b.id, None).await.unwrap();
        store.fail_step(failed.id, "boom".into(), None).await.unwrap();
        store
            .finish_episode(episode.id, EpisodeStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        // terminal episodes stay terminal
        store
            .finish_episode(episode.id, EpisodeStatus::Completed, None)
            .await
            .unwrap();

        let loaded = store.get_episode(episode.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EpisodeStatus::Failed);
        assert_eq!(loaded.current_state_id, Some(b.id));
        assert_eq!(loaded.last_completed_state_id, Some(a.id));
        assert_eq!(loaded.error.as_deref(), Some("boom"));

        let steps = store.episode_steps(episode.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].output.as_deref(), Some("done"));
        assert!(steps[0].finished_at.is_some());
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert_eq!(steps[1].output.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn messages_are_sequenced_with_sender_names() {
        let store = Store::open_in_memory().unwrap();
        let (scenario, a, _) = seeded_scenario(&store).await;
        let learner = store
            .find_or_create_user(User::new("learner", UserKind::Learner, "m"))
            .await
            .unwrap();
        let agent = store
            .find_or_create_user(User::new("nurse_1", UserKind::Agent, "m"))
            .await
            .unwrap();
        let episode = store.create_episode(scenario.id, learner.id).await.unwrap();
        let conv = store.create_conversation(episode.id, a.id).await.unwrap();

        store
            .append_message(conv.id, agent.id, "hello".into())
            .await
            .unwrap();
        store
            .append_message(conv.id, learner.id, "hi".into())
            .await
            .unwrap();

        let messages = store.conversation_messages(conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].seq, 0);
        assert_eq!(messages[0].sender_name, "nurse_1");
        assert_eq!(messages[1].seq, 1);
        assert_eq!(messages[1].content, "hi");
    }

    #[tokio::test]
    async fn episode_memories_are_written_once() {
        let store = Store::open_in_memory().unwrap();
        let (scenario, _, _) = seeded_scenario(&store).await;
        let learner = store
            .find_or_create_user(User::new("learner", UserKind::Learner, "m"))
            .await
            .unwrap();
        let episode = store.create_episode(scenario.id, learner.id).await.unwrap();

        let batch = vec![
            Memory::new(learner.id, "lesson one", 0.7).with_episode(episode.id, scenario.id),
        ];
        let (written, inserted) = store
            .insert_episode_memories(episode.id, batch)
            .await
            .unwrap();
        assert!(inserted);
        assert_eq!(written.len(), 1);

        let again = vec![
            Memory::new(learner.id, "lesson two", 0.7).with_episode(episode.id, scenario.id),
        ];
        let (existing, inserted) = store
            .insert_episode_memories(episode.id, again)
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(existing[0].content, "lesson one");
        assert_eq!(store.count_memories(learner.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn user_memories_ordering_and_access() {
        let store = Store::open_in_memory().unwrap();
        let user = store
            .find_or_create_user(User::new("learner", UserKind::Learner, "m"))
            .await
            .unwrap();
        let mut old = Memory::new(user.id, "old but important", 0.9);
        old.created_at = Utc::now() - Duration::hours(2);
        let new = Memory::new(user.id, "new and minor", 0.1);
        store.insert_memory(old.clone()).await.unwrap();
        store.insert_memory(new.clone()).await.unwrap();

        let recent = store
            .user_memories(user.id, MemoryOrder::Recency, None)
            .await
            .unwrap();
        assert_eq!(recent[0].id, new.id);
        let important = store
            .user_memories(user.id, MemoryOrder::Importance, Some(1))
            .await
            .unwrap();
        assert_eq!(important.len(), 1);
        assert_eq!(important[0].id, old.id);

        store.record_memory_access(vec![old.id]).await.unwrap();
        let bumped = store
            .record_memory_access(vec![old.id, Uuid::new_v4()])
            .await
            .unwrap();
        assert_eq!(bumped.len(), 1);
        assert_eq!(bumped[&old.id].0, 2);
        let reloaded = store
            .user_memories(user.id, MemoryOrder::Importance, Some(1))
            .await
            .unwrap();
        assert_eq!(reloaded[0].access_count, 2);
        assert!(reloaded[0].last_accessed.is_some());
    }

    #[tokio::test]
    async fn embedding_cache_returns_only_hits_per_namespace() {
        let store = Store::open_in_memory().unwrap();
        store
            .cache_embeddings(
                "openai:text-embedding-3-small",
                vec![
                    ("h1".to_string(), vec![0.5, -0.25]),
                    ("h2".to_string(), vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let found = store
            .cached_embeddings(
                "openai:text-embedding-3-small",
                vec!["h1".to_string(), "h3".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["h1"], vec![0.5, -0.25]);

        let other = store
            .cached_embeddings("hashing", vec!["h1".to_string()])
            .await
            .unwrap();
        assert!(other.is_empty());

        let stats = store.embedding_cache_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].namespace, "openai:text-embedding-3-small");
        assert_eq!(stats[0].entries, 2);
        assert!(stats[0].last_written.is_some());
    }

    #[test]
    fn vector_blob_rejects_misaligned_bytes() {
        assert_eq!(decode_vector(&encode_vector(&[1.5, -2.0])).unwrap(), vec![1.5, -2.0]);
        assert!(decode_vector(&[0, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn open_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agir.db");
        {
            let store = Store::open(&path).unwrap();
            store
                .find_or_create_user(User::new("persisted", UserKind::Agent, "m"))
                .await
                .unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert!(reopened
            .find_user_by_username("persisted")
            .await
            .unwrap()
            .is_some());
    }
}
