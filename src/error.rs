//! Domain errors raised by the service layer.
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Every failure the service surfaces to its callers.
///
/// The type is `Clone` because deduplicated requests hand one settled outcome
/// to every waiter.
#[derive(Debug, Clone, Error)]
pub enum BeansError {
    #[error("beans binary `{binary}` not found; install beans or set `beans.binary` in the settings file")]
    NotFound { binary: String },
    #[error("beans timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },
    #[error("failed to start beans: {0}")]
    Spawn(String),
    #[error("beans failed: {message}")]
    Command { message: String },
    /// Non-zero exit with an `Error:` line: beans refused the request itself.
    #[error("beans rejected the request: {0}")]
    Rejected(String),
    #[error("beans output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },
    #[error("invalid beans response: {message}")]
    Parse { message: String, raw: String },
    #[error("beans reported: {0}")]
    Backend(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("beans is unavailable and no cached data can be served: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for BeansError {
    fn from(err: std::io::Error) -> Self {
        BeansError::Io(Arc::new(err))
    }
}

impl BeansError {
    pub fn parse(message: impl Into<String>, raw: impl Into<String>) -> Self {
        BeansError::Parse {
            message: message.into(),
            raw: raw.into(),
        }
    }

    /// Whether the retry controller may try the same request again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BeansError::Timeout { .. }
                | BeansError::Spawn(_)
                | BeansError::Command { .. }
                | BeansError::OutputTooLarge { .. }
                | BeansError::Io(_)
        )
    }

    /// Whether the failure means the backend cannot be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BeansError::NotFound { .. } | BeansError::Timeout { .. } | BeansError::Spawn(_)
        )
    }

    /// Raw response body for parse failures.
    pub fn raw_payload(&self) -> Option<&str> {
        match self {
            BeansError::Parse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

pub type Result<T, E = BeansError> = std::result::Result<T, E>;
