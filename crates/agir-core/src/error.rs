use agir_provider::GenerationError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed scenario graph; reported before any episode starts.
    #[error("construction error: {0}")]
    Construction(String),
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("no candidate user for role {role}")]
    NoCandidate { role: String },
    #[error("episode {0} is not completed")]
    EpisodeNotCompleted(Uuid),
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Splits an `anyhow` error coming out of the memory layer back into the
    /// generation/persistence halves of the taxonomy.
    pub fn from_pipeline(err: anyhow::Error) -> Self {
        match err.downcast::<GenerationError>() {
            Ok(generation) => EngineError::Generation(generation),
            Err(other) => EngineError::Persistence(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
