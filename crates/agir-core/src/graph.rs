use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use agir_schema::{Episode, Role, Scenario, State, Transition, User};
use agir_store::Store;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Nodes with no incoming edge, in node order.
pub fn initial_candidates<T: Eq + Hash + Clone>(nodes: &[T], edges: &[(T, T)]) -> Vec<T> {
    let targets: HashSet<&T> = edges.iter().map(|(_, to)| to).collect();
    nodes
        .iter()
        .filter(|node| !targets.contains(node))
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub state: State,
    /// Participating roles in declaration order.
    pub roles: Vec<Role>,
}

/// A scenario's states, roles and transitions, checked for consistency.
#[derive(Debug, Clone)]
pub struct ScenarioGraph {
    pub scenario: Scenario,
    nodes: Vec<StateNode>,
    index: HashMap<Uuid, usize>,
    roles: Vec<Role>,
    initial: Uuid,
}

impl ScenarioGraph {
    pub async fn load(store: &Store, scenario_id: Uuid) -> EngineResult<Self> {
        let scenario = store
            .get_scenario(scenario_id)
            .await?
            .ok_or_else(|| EngineError::not_found("scenario", scenario_id))?;
        let states = store.scenario_states(scenario_id).await?;
        let roles = store.scenario_roles(scenario_id).await?;
        let transitions = store.scenario_transitions(scenario_id).await?;

        let mut nodes = Vec::with_capacity(states.len());
        for state in states {
            let state_roles = store.state_roles(state.id).await?;
            nodes.push(StateNode {
                state,
                roles: state_roles,
            });
        }

        Self::assemble(scenario, nodes, roles, transitions)
    }

    fn assemble(
        scenario: Scenario,
        nodes: Vec<StateNode>,
        roles: Vec<Role>,
        transitions: Vec<Transition>,
    ) -> EngineResult<Self> {
        if nodes.is_empty() {
            return Err(EngineError::Construction(format!(
                "scenario {} has no states",
                scenario.name
            )));
        }

        let index: HashMap<Uuid, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.state.id, i))
            .collect();

        for transition in &transitions {
            for end in [transition.from_state_id, transition.to_state_id] {
                if !index.contains_key(&end) {
                    return Err(EngineError::Construction(format!(
                        "transition {} references unknown state {end}",
                        transition.id
                    )));
                }
            }
        }

        let ids: Vec<Uuid> = nodes.iter().map(|n| n.state.id).collect();
        let edges: Vec<(Uuid, Uuid)> = transitions
            .iter()
            .map(|t| (t.from_state_id, t.to_state_id))
            .collect();
        let candidates = initial_candidates(&ids, &edges);
        let initial = match candidates.as_slice() {
            [only] => *only,
            [] => {
                return Err(EngineError::Construction(format!(
                    "scenario {} has no initial state: every state has an incoming transition",
                    scenario.name
                )))
            }
            many => {
                let names: Vec<&str> = many
                    .iter()
                    .filter_map(|id| index.get(id).map(|&i| nodes[i].state.name.as_str()))
                    .collect();
                return Err(EngineError::Construction(format!(
                    "scenario {} has {} initial state candidates: {}",
                    scenario.name,
                    many.len(),
                    names.join(", ")
                )));
            }
        };

        if let Some(name) = &scenario.learner_role {
            if !roles.iter().any(|r| &r.name == name) {
                return Err(EngineError::Construction(format!(
                    "learner role {name} is not declared in scenario {}",
                    scenario.name
                )));
            }
        }

        Ok(Self {
            scenario,
            nodes,
            index,
            roles,
            initial,
        })
    }

    pub fn initial_state(&self) -> &StateNode {
        &self.nodes[self.index[&self.initial]]
    }

    pub fn state(&self, id: Uuid) -> Option<&StateNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn states(&self) -> &[StateNode] {
        &self.nodes
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn is_learner_role(&self, role: &Role) -> bool {
        self.scenario.learner_role.as_deref() == Some(role.name.as_str())
    }
}

/// Everything a component needs to act inside one running episode.
#[derive(Debug, Clone)]
pub struct EpisodeContext {
    pub episode: Episode,
    pub learner: User,
    pub graph: std::sync::Arc<ScenarioGraph>,
}
