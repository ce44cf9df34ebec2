use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use agir_schema::{Role, Scenario, State, Transition, User, UserKind, UserProfile};
use agir_store::Store;
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::graph::initial_candidates;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioFile {
    scenario: ScenarioDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerSpec {
    pub username: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub description: String,
}

/// Roles may be written as bare names or as full records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleSpec {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        model: Option<String>,
    },
}

impl RoleSpec {
    pub fn name(&self) -> &str {
        match self {
            RoleSpec::Name(name) => name,
            RoleSpec::Full { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec {
    #[serde(alias = "from_state_name")]
    pub from: String,
    #[serde(alias = "to_state_name")]
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
}

/// Declarative scenario as read from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub learner_role: Option<String>,
    #[serde(default)]
    pub learner: Option<LearnerSpec>,
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
    #[serde(default)]
    pub states: Vec<StateSpec>,
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
}

/// What `install` wrote, or found already present.
#[derive(Debug, Clone)]
pub struct InstalledScenario {
    pub scenario: Scenario,
    pub learner: Option<User>,
}

impl ScenarioDefinition {
    /// Parses either a `scenario:`-wrapped document or a bare definition.
    pub fn from_yaml(text: &str) -> EngineResult<Self> {
        let parsed = match serde_yaml::from_str::<ScenarioFile>(text) {
            Ok(file) => Ok(file.scenario),
            Err(_) => serde_yaml::from_str::<ScenarioDefinition>(text),
        };
        parsed.map_err(|e| EngineError::Construction(format!("invalid scenario yaml: {e}")))
    }

    pub fn from_path(path: &Path) -> EngineResult<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario file: {}", path.display()))?;
        Self::from_yaml(&text)
    }

    /// Reports every consistency problem at once.
    pub fn validate(&self) -> EngineResult<()> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("scenario name is empty".to_string());
        }

        let mut roles = HashSet::new();
        for role in &self.roles {
            if !roles.insert(role.name()) {
                problems.push(format!("duplicate role: {}", role.name()));
            }
        }
        if let Some(learner_role) = &self.learner_role {
            if !roles.contains(learner_role.as_str()) {
                problems.push(format!("learner_role {learner_role} is not a declared role"));
            }
        }

        let mut states = HashSet::new();
        for state in &self.states {
            if !states.insert(state.name.as_str()) {
                problems.push(format!("duplicate state: {}", state.name));
            }
            for role in &state.roles {
                if !roles.contains(role.as_str()) {
                    problems.push(format!(
                        "state {} references undeclared role {role}",
                        state.name
                    ));
                }
            }
        }
        if self.states.is_empty() {
            problems.push("scenario declares no states".to_string());
        }

        for transition in &self.transitions {
            for end in [&transition.from, &transition.to] {
                if !states.contains(end.as_str()) {
                    problems.push(format!(
                        "transition {} -> {} references unknown state {end}",
                        transition.from, transition.to
                    ));
                }
            }
        }

        if !self.states.is_empty() {
            let names: Vec<&str> = self.states.iter().map(|s| s.name.as_str()).collect();
            let edges: Vec<(&str, &str)> = self
                .transitions
                .iter()
                .map(|t| (t.from.as_str(), t.to.as_str()))
                .collect();
            let initial = initial_candidates(&names, &edges);
            if initial.len() != 1 {
                problems.push(format!(
                    "expected exactly one initial state, found {}: [{}]",
                    initial.len(),
                    initial.join(", ")
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Construction(problems.join("; ")))
        }
    }

    /// Writes the definition through find-or-create by natural key, so running
    /// it twice changes nothing.
    pub async fn install(
        &self,
        store: &Store,
        default_model: &str,
    ) -> EngineResult<InstalledScenario> {
        self.validate()?;

        let scenario = store
            .find_or_create_scenario(Scenario {
                id: Uuid::new_v4(),
                name: self.name.clone(),
                description: self.description.clone(),
                learner_role: self.learner_role.clone(),
                objective: self.learner.as_ref().and_then(|l| l.objective.clone()),
                created_at: Utc::now(),
            })
            .await?;

        let mut roles: HashMap<String, Role> = HashMap::new();
        for spec in &self.roles {
            let (name, description, model) = match spec {
                RoleSpec::Name(name) => (name.clone(), String::new(), None),
                RoleSpec::Full {
                    name,
                    description,
                    model,
                } => (name.clone(), description.clone(), model.clone()),
            };
            let role = store
                .find_or_create_role(Role {
                    id: Uuid::new_v4(),
                    scenario_id: scenario.id,
                    name: name.clone(),
                    description,
                    model,
                })
                .await?;
            roles.insert(name, role);
        }

        let mut states: HashMap<String, State> = HashMap::new();
        for spec in &self.states {
            let state = store
                .find_or_create_state(State {
                    id: Uuid::new_v4(),
                    scenario_id: scenario.id,
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                })
                .await?;
            for (position, role_name) in spec.roles.iter().enumerate() {
                if let Some(role) = roles.get(role_name) {
                    store
                        .attach_role_to_state(state.id, role.id, position as i64)
                        .await?;
                }
            }
            states.insert(spec.name.clone(), state);
        }

        for spec in &self.transitions {
            let (Some(from), Some(to)) = (states.get(&spec.from), states.get(&spec.to)) else {
                continue;
            };
            store
                .find_or_create_transition(Transition {
                    id: Uuid::new_v4(),
                    scenario_id: scenario.id,
                    from_state_id: from.id,
                    to_state_id: to.id,
                    condition: spec.condition.clone(),
                })
                .await?;
        }

        let learner = match &self.learner {
            Some(spec) => {
                let model = spec.model.clone().unwrap_or_else(|| default_model.to_string());
                let user = User::new(spec.username.clone(), UserKind::Learner, model).with_profile(
                    UserProfile {
                        first_name: spec.first_name.clone(),
                        last_name: spec.last_name.clone(),
                        description: spec.description.clone(),
                    },
                );
                let (profile, model) = (user.profile.clone(), user.model.clone());
                let mut stored = store.find_or_create_user(user).await?;
                if stored.profile != profile || stored.model != model {
                    store
                        .update_user_profile(stored.id, profile.clone(), model.clone())
                        .await?;
                    tracing::info!(user = %stored.username, "learner profile updated");
                    stored.profile = profile;
                    stored.model = model;
                }
                Some(stored)
            }
            None => None,
        };

        tracing::info!(
            scenario = %scenario.name,
            roles = roles.len(),
            states = states.len(),
            transitions = self.transitions.len(),
            "scenario installed"
        );

        Ok(InstalledScenario { scenario, learner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THERAPY: &str = r#"
scenario:
  name: therapy session
  description: a short counselling arc
  learner_role: therapist
  learner:
    username: learner_one
    model: stub/echo
    objective: build rapport quickly
  roles:
    - name: therapist
      description: runs the session
    - name: patient
      description: seeks help
      model: stub/patient
    - observer
  states:
    - name: intake
      description: gather the presenting problem
      roles: [therapist, patient]
    - name: assessment
      description: assess progress
      roles: [therapist]
    - name: follow up
      description: schedule more sessions
      roles: [patient]
    - name: discharge
      description: close the case
  transitions:
    - from: intake
      to: assessment
    - from_state_name: assessment
      to_state_name: discharge
      condition: the patient shows stable improvement
    - from: assessment
      to: follow up
      condition: the patient has not improved
"#;

    #[test]
    fn parses_wrapped_document_and_role_shorthand() {
        let def = ScenarioDefinition::from_yaml(THERAPY).unwrap();
        assert_eq!(def.name, "therapy session");
        assert_eq!(def.roles.len(), 3);
        assert_eq!(def.roles[2].name(), "observer");
        assert_eq!(def.transitions[1].from, "assessment");
        assert_eq!(def.learner.as_ref().unwrap().username, "learner_one");
        def.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_problem() {
        let def = ScenarioDefinition::from_yaml(
            r#"
name: broken
learner_role: ghost
roles: [a]
states:
  - name: one
    roles: [a, b]
  - name: two
transitions:
  - from: one
    to: three
"#,
        )
        .unwrap();
        let EngineError::Construction(msg) = def.validate().unwrap_err() else {
            panic!("expected construction error");
        };
        assert!(msg.contains("learner_role ghost"));
        assert!(msg.contains("undeclared role b"));
        assert!(msg.contains("unknown state three"));
        assert!(msg.contains("exactly one initial state"));
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let def = ScenarioDefinition::from_yaml(THERAPY).unwrap();

        let first = def.install(&store, "stub/default").await.unwrap();
        let second = def.install(&store, "stub/default").await.unwrap();
        assert_eq!(first.scenario.id, second.scenario.id);
        assert_eq!(
            first.learner.as_ref().map(|u| u.id),
            second.learner.as_ref().map(|u| u.id)
        );

        let id = first.scenario.id;
        assert_eq!(store.scenario_roles(id).await.unwrap().len(), 3);
        assert_eq!(store.scenario_states(id).await.unwrap().len(), 4);
        assert_eq!(store.scenario_transitions(id).await.unwrap().len(), 3);
        assert_eq!(first.scenario.objective.as_deref(), Some("build rapport quickly"));

        let intake = store
            .scenario_states(id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.name == "intake")
            .unwrap();
        let names: Vec<String> = store
            .state_roles(intake.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["therapist", "patient"]);
    }

    #[tokio::test]
    async fn reinstall_updates_the_learner_profile_and_model() {
        let store = Store::open_in_memory().unwrap();
        let def = ScenarioDefinition::from_yaml(THERAPY).unwrap();
        let first = def.install(&store, "stub/default").await.unwrap().learner.unwrap();
        assert_eq!(first.model, "stub/echo");

        let revised = THERAPY
            .replace("    model: stub/echo\n", "    model: stub/careful\n    first_name: Lena\n");
        let def = ScenarioDefinition::from_yaml(&revised).unwrap();
        let second = def.install(&store, "stub/default").await.unwrap().learner.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.model, "stub/careful");
        assert_eq!(second.profile.first_name, "Lena");

        let stored = store.get_user(first.id).await.unwrap().unwrap();
        assert_eq!(stored.model, "stub/careful");
        assert_eq!(stored.display_name(), "Lena");
    }

    #[tokio::test]
    async fn invalid_definition_writes_nothing() {
        let store = Store::open_in_memory().unwrap();
        let def = ScenarioDefinition::from_yaml(
            "name: loop\nstates: [{name: a}, {name: b}]\ntransitions: [{from: a, to: b}, {from: b, to: a}]\n",
        )
        .unwrap();
        assert!(def.install(&store, "m").await.is_err());
        assert!(store.find_scenario_by_name("loop").await.unwrap().is_none());
    }
}
