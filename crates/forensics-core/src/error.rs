use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForensicsError {
    #[error("No valid forensics signals or evidence IDs were provided")]
    EmptyBatch,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Phase '{phase}' failed: {message}")]
    PhaseFailure { phase: String, message: String },

    #[error("Blackboard unavailable: {0}")]
    BlackboardUnavailable(String),
}

pub type ForensicsResult<T> = Result<T, ForensicsError>;
