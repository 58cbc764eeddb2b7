use thiserror::Error;

/// Errors surfaced by the mirror engine and its store seams.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Kind cannot be mapped to a collection; callers skip the kind and continue.
    #[error("resolution: {0}")]
    Resolution(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// Resource-version mismatch on update. Not retried; the next change event re-triggers.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store: {0}")]
    Store(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl MirrorError {
    pub fn is_not_found(&self) -> bool { matches!(self, MirrorError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, MirrorError::Conflict(_)) }
}

pub type MirrorResult<T> = Result<T, MirrorError>;
