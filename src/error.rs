use thiserror::Error;

use crate::state_machine::JobState;

#[derive(Debug, Error)]
pub enum ReelgateError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("Resource conflict entering {state}: {reason}")]
    ResourceConflict { state: JobState, reason: String },

    #[error("Edit plan rejected with {} error(s)", .0.len())]
    Validation(Vec<String>),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Editor error: {0}")]
    Editor(String),

    #[error("Planner error: {0}")]
    Planner(#[from] crate::planner::PlannerError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ReelgateError>;

impl ReelgateError {
    /// Errors caused by the caller's request rather than by the host.
    /// Rejections leave persisted state untouched and may be retried later.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ReelgateError::IllegalTransition { .. }
                | ReelgateError::ResourceConflict { .. }
                | ReelgateError::Validation(_)
                | ReelgateError::InvalidInput(_)
        )
    }
}
