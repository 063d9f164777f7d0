/// Error enum mapping low-level failures to scheduler categories.
///
/// Categories:
/// - Config: detected eagerly, aborts the whole run before any submission
/// - Submission: transient, retried per job up to a ceiling
/// - Database / Io / Artifact: storage and filesystem failures
/// - Plan: invalid task plan or chunk manifest, reported before execution
#[derive(Debug, thiserror::Error)]
pub enum MillError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Invalid plan: {0}")]
    Plan(String),

    #[error("{0}")]
    Internal(String),
}

pub type MillResult<T> = Result<T, MillError>;

impl MillError {
    /// Returns true if the error must abort the whole run before or during
    /// execution (configuration-class failures).
    pub fn is_fatal(&self) -> bool {
        matches!(self, MillError::Config(_) | MillError::Plan(_))
    }

    /// Returns true if the failing operation may be retried on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MillError::Submission(_))
    }
}

impl From<serde_json::Error> for MillError {
    fn from(err: serde_json::Error) -> Self {
        MillError::Artifact(err.to_string())
    }
}
