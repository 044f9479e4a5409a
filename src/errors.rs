use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("code failed security validation: {0}")]
    Validation(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("output is not available for job '{0}'")]
    OutputNotReady(String),

    #[error("could not read output file: {0}")]
    OutputUnreadable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// True for errors that mean "the referenced thing does not exist",
    /// as opposed to "the system itself failed".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SandboxError::SessionNotFound(_)
                | SandboxError::JobNotFound(_)
                | SandboxError::OutputNotReady(_)
        )
    }
}
