//! Scenario engine: loads scenario graphs, assigns agents to roles, runs episodes
//! step by step, and turns finished episodes and documents into learner memories.

pub mod assignment;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod episode;
pub mod error;
pub mod graph;
mod persona;
pub mod scenario;
pub mod step;
pub mod synthesis;
pub mod transition;

pub use assignment::{AgentAssignmentResolver, AssignmentCounters, CountMismatch};
pub use config::{AssignmentMode, EmbeddingBackend, EngineConfig, CONCLUSION_MARKER};
pub use conversation::{ConversationOutcome, ConversationRunner, CLOSING_MESSAGE};
pub use engine::{AssignmentReport, AssignmentRow, Engine};
pub use episode::{EpisodeDriver, EpisodeResult};
pub use error::{EngineError, EngineResult};
pub use graph::{EpisodeContext, ScenarioGraph, StateNode};
pub use scenario::{InstalledScenario, ScenarioDefinition};
pub use step::{StepExecutor, StepOutcome};
pub use synthesis::MemorySynthesizer;
pub use transition::{DecisionKind, TransitionDecision, TransitionResolver};
