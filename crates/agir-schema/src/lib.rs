//! Domain records shared by every agir crate: users, scenarios and their graphs,
//! episodes, steps, conversations and memories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    /// The improving subject of a scenario.
    Learner,
    /// A role-player.
    Agent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub kind: UserKind,
    pub profile: UserProfile,
    /// Model identifier used for every generation made on behalf of this user.
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, kind: UserKind, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            kind,
            profile: UserProfile::default(),
            model: model.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.profile = profile;
        self
    }

    /// "First Last" when the profile carries a name, the username otherwise.
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.profile.first_name, self.profile.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Role always played by the episode's learner.
    pub learner_role: Option<String>,
    /// What the learner is trying to get better at; scopes memory synthesis.
    pub objective: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub name: String,
    pub description: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    /// Natural-language predicate judged by a model against the step output.
    pub condition: Option<String>,
}

impl Transition {
    pub fn condition_text(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpisodeStatus {
    Running,
    Completed,
    Failed,
}

impl EpisodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EpisodeStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub learner_id: Uuid,
    pub status: EpisodeStatus,
    pub current_state_id: Option<Uuid>,
    /// Last state whose step completed; kept for forensic replay of failures.
    pub last_completed_state_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentAssignment {
    pub id: Uuid,
    pub role_id: Uuid,
    pub episode_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub state_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: StepStatus,
    /// Generated text, the rendered transcript, or the error for failed steps.
    pub output: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub state_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    /// Position within the conversation, starting at zero.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

pub const MEMORY_SOURCE_EPISODE: &str = "episode";
pub const MEMORY_SOURCE_DOCUMENT: &str = "document";
pub const MEMORY_SOURCE_MANUAL: &str = "manual";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    /// Always within 0.0..=1.0.
    pub importance: f64,
    pub source: String,
    pub episode_id: Option<Uuid>,
    pub scenario_id: Option<Uuid>,
    pub document: Option<String>,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(user_id: Uuid, content: impl Into<String>, importance: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            content: content.into(),
            importance: clamp_importance(importance),
            source: MEMORY_SOURCE_MANUAL.to_string(),
            episode_id: None,
            scenario_id: None,
            document: None,
            access_count: 0,
            last_accessed: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_episode(mut self, episode_id: Uuid, scenario_id: Uuid) -> Self {
        self.source = MEMORY_SOURCE_EPISODE.to_string();
        self.episode_id = Some(episode_id);
        self.scenario_id = Some(scenario_id);
        self
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.source = MEMORY_SOURCE_DOCUMENT.to_string();
        self.document = Some(document.into());
        self
    }
}

/// Clamps to 0.0..=1.0, mapping NaN to zero.
pub fn clamp_importance(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
