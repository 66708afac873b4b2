//! Error kinds produced by the execution engine.

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error kinds.
///
/// Assertion failures are not errors: they mark a step as failed and feed
/// the retry loop. Everything here either aborts a case, a step, or is
/// logged and skipped by the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid step definition: {0}")]
    Definition(String),

    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function '{name}' failed: {reason}")]
    FunctionCall { name: String, reason: String },

    #[error("Failed to load function record '{record}': {reason}")]
    FunctionLoad { record: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("SQL execution error: {0}")]
    SqlExecution(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// `true` for errors that abort the remainder of a case.
    pub fn is_fatal_to_case(&self) -> bool {
        matches!(
            self,
            EngineError::Definition(_)
                | EngineError::UndefinedVariable(_)
                | EngineError::Transport(_)
                | EngineError::SqlExecution(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Transport(format!("request timed out: {e}"))
        } else {
            EngineError::Transport(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::SqlExecution(e.to_string())
    }
}
