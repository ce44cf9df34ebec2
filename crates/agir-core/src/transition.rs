use std::collections::HashMap;
use std::sync::Arc;

use agir_provider::ModelRouter;
use agir_schema::{State, Transition};
use agir_store::Store;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// No outgoing transition.
    Terminal,
    /// A single transition without a condition.
    Unconditional,
    /// The model picked exactly one option.
    Judged,
    /// The model answer was ambiguous or unreadable; the first listed transition was taken.
    Fallback,
}

/// Where an episode goes after a state, and how sure the engine is about it.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionDecision {
    pub from_state_id: Uuid,
    pub next_state_id: Option<Uuid>,
    pub transition_id: Option<Uuid>,
    pub kind: DecisionKind,
}

impl TransitionDecision {
    pub fn fallback_used(&self) -> bool {
        self.kind == DecisionKind::Fallback
    }

    pub fn is_terminal(&self) -> bool {
        self.next_state_id.is_none()
    }
}

pub struct TransitionResolver {
    store: Store,
    router: Arc<ModelRouter>,
}

impl TransitionResolver {
    pub fn new(store: Store, router: Arc<ModelRouter>) -> Self {
        Self { store, router }
    }

    /// Picks the successor of `from` given the output it just produced.
    /// Model failures propagate; ambiguous answers do not.
    pub async fn resolve_next(
        &self,
        from: &State,
        step_output: &str,
        judge_model: &str,
    ) -> EngineResult<TransitionDecision> {
        let transitions = self.store.transitions_from(from.id).await?;

        let decide = |transition: Option<&Transition>, kind| TransitionDecision {
            from_state_id: from.id,
            next_state_id: transition.map(|t| t.to_state_id),
            transition_id: transition.map(|t| t.id),
            kind,
        };

        match transitions.as_slice() {
            [] => return Ok(decide(None, DecisionKind::Terminal)),
            [only] if only.condition_text().is_none() => {
                return Ok(decide(Some(only), DecisionKind::Unconditional))
            }
            _ => {}
        }

        let names: HashMap<Uuid, String> = self
            .store
            .scenario_states(from.scenario_id)
            .await?
            .into_iter()
            .map(|s| (s.id, s.name))
            .collect();
        let options: Vec<(&Transition, &str)> = transitions
            .iter()
            .map(|t| {
                let name = names.get(&t.to_state_id).map(String::as_str).unwrap_or("");
                (t, name)
            })
            .collect();

        let prompt = judge_prompt(&from.name, step_output, &options);
        let answer = self.router.generate(judge_model, &prompt).await?;
        let target_names: Vec<&str> = options.iter().map(|(_, name)| *name).collect();

        match parse_choice(&answer, &target_names) {
            Some(i) => {
                let decision = decide(Some(options[i].0), DecisionKind::Judged);
                tracing::info!(
                    state = %from.name,
                    next = %options[i].1,
                    "transition resolved"
                );
                Ok(decision)
            }
            None => {
                let (first, name) = options[0];
                tracing::warn!(
                    state = %from.name,
                    state_id = %from.id,
                    next = %name,
                    answer = %answer.trim(),
                    "transition resolution fallback"
                );
                Ok(decide(Some(first), DecisionKind::Fallback))
            }
        }
    }
}

fn judge_prompt(from: &str, step_output: &str, options: &[(&Transition, &str)]) -> String {
    let mut prompt = format!(
        "A scenario has just finished the state \"{from}\".\n\nWhat happened:\n{}\n\nDetermine which of the following conditions is true:\n",
        step_output.trim()
    );
    for (i, (transition, name)) in options.iter().enumerate() {
        let condition = transition.condition_text().unwrap_or("none of the other conditions hold");
        prompt.push_str(&format!("{}. Transition to '{name}' if: {condition}\n", i + 1));
    }
    prompt.push_str(
        "\nRespond with ONLY the number or the name of the destination state whose condition holds.",
    );
    prompt
}

/// Maps a model answer onto an option index, or `None` when the answer is
/// unreadable or names more than one distinct option.
pub(crate) fn parse_choice(answer: &str, names: &[&str]) -> Option<usize> {
    let cleaned = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
        .trim();
    if cleaned.is_empty() {
        return None;
    }

    if let Some(i) = names.iter().position(|n| n.eq_ignore_ascii_case(cleaned)) {
        return Some(i);
    }

    if let Ok(n) = cleaned.parse::<usize>() {
        return (1..=names.len()).contains(&n).then(|| n - 1);
    }

    let words = normalized_words(cleaned);
    let mut hits: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            let needle = normalized_words(name);
            !needle.is_empty() && contains_run(&words, &needle)
        })
        .map(|(i, _)| i)
        .collect();

    // "not improved" also contains "improved"; keep only the longest readings.
    let snapshot = hits.clone();
    hits.retain(|&i| {
        let mine = normalized_words(names[i]);
        !snapshot.iter().any(|&j| {
            j != i && {
                let other = normalized_words(names[j]);
                other.len() > mine.len() && contains_run(&other, &mine)
            }
        })
    });

    let mut targets: Vec<String> = hits.iter().map(|&i| names[i].to_lowercase()).collect();
    targets.dedup();
    match (hits.first(), targets.len()) {
        (Some(&i), 1) => Some(i),
        _ => {
            if hits.is_empty() {
                leading_number(cleaned, names.len())
            } else {
                None
            }
        }
    }
}

fn normalized_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn contains_run(haystack: &[String], needle: &[String]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// "2. Discharge", "Option 2" and similar.
fn leading_number(text: &str, options: usize) -> Option<usize> {
    let numbers: Vec<usize> = text
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|w| w.parse().ok())
        .filter(|n| (1..=options).contains(n))
        .collect();
    match numbers.as_slice() {
        [n] => Some(n - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: [&str; 2] = ["Improved", "Not Improved"];

    #[test]
    fn exact_name_or_number_selects_option() {
        assert_eq!(parse_choice("Improved", &NAMES), Some(0));
        assert_eq!(parse_choice("'not improved'.", &NAMES), Some(1));
        assert_eq!(parse_choice("2", &NAMES), Some(1));
        assert_eq!(parse_choice("3", &NAMES), None);
    }

    #[test]
    fn longer_name_wins_over_contained_name() {
        assert_eq!(
            parse_choice("The patient has Not Improved yet", &NAMES),
            Some(1)
        );
        assert_eq!(parse_choice("They clearly improved.", &NAMES), Some(0));
    }

    #[test]
    fn unrelated_or_mixed_answers_are_ambiguous() {
        assert_eq!(parse_choice("hard to say", &NAMES), None);
        assert_eq!(
            parse_choice("either discharge or follow up", &["discharge", "follow up"]),
            None
        );
        assert_eq!(parse_choice("", &NAMES), None);
    }

    #[test]
    fn numbered_answers_are_read() {
        assert_eq!(parse_choice("Option 2", &["discharge", "follow up"]), Some(1));
        assert_eq!(parse_choice("1 or 2", &["discharge", "follow up"]), None);
    }
}
