//! Error types for the taskline engine.
//!
//! Stage functions fault with [`anyhow::Error`]; the engine wraps those faults
//! in [`TasklineError`] before handing them to an `on_error` callback, the
//! fault sink, or a blocking `get()` caller.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = TasklineError> = std::result::Result<T, E>;

/// The main error type for taskline operations.
///
/// Cloning is cheap: stage causes are shared behind an `Arc` so the same
/// fault can be delivered to a callback and kept for `get()`.
#[derive(Debug, Clone, Error)]
pub enum TasklineError {
    /// A stage function returned an error or panicked.
    #[error("stage {stage} failed: {cause:#}")]
    Stage {
        /// Zero-based position of the stage in its chain.
        stage: usize,
        /// The fault raised by the stage function.
        cause: Arc<anyhow::Error>,
    },

    /// A merge branch failed; siblings were cancelled.
    #[error("merge branch {branch} failed: {cause}")]
    Merge {
        /// Zero-based position of the failing branch.
        branch: usize,
        /// The first fault observed across all branches.
        cause: Box<TasklineError>,
    },

    /// The work was cancelled before it reached a terminal callback.
    #[error("work cancelled")]
    Cancelled,

    /// A filter stage rejected the value.
    #[error("value discarded by filter at stage {stage}")]
    Discarded {
        /// Zero-based position of the filter stage.
        stage: usize,
    },

    /// Waiting for a terminal value timed out.
    #[error("timed out after {0:?} waiting for work to finish")]
    Timeout(std::time::Duration),

    /// The engine configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The background runtime could not be built.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TasklineError {
    /// Wraps a stage fault.
    #[must_use]
    pub fn stage(stage: usize, cause: anyhow::Error) -> Self {
        Self::Stage {
            stage,
            cause: Arc::new(cause),
        }
    }

    /// Wraps the first fault of a merge branch.
    #[must_use]
    pub fn merge(branch: usize, cause: Self) -> Self {
        Self::Merge {
            branch,
            cause: Box::new(cause),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error reports a cancellation rather than a fault.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the innermost stage fault, following merge wrappers.
    #[must_use]
    pub fn root_cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Stage { cause, .. } => Some(cause.as_ref()),
            Self::Merge { cause, .. } => cause.root_cause(),
            _ => None,
        }
    }

    /// Returns a stable name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stage { .. } => "StageFailure",
            Self::Merge { .. } => "MergeFailure",
            Self::Cancelled => "CancellationObserved",
            Self::Discarded { .. } => "Discarded",
            Self::Timeout(_) => "Timeout",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Runtime(_) => "Runtime",
            Self::Internal(_) => "Internal",
        }
    }

    /// Converts to a dictionary representation for structured logging.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::Stage { stage, .. } | Self::Discarded { stage } => {
                map.insert("stage".to_string(), serde_json::json!(stage));
            }
            Self::Merge { branch, cause } => {
                map.insert("branch".to_string(), serde_json::json!(branch));
                let inner: serde_json::Map<String, serde_json::Value> =
                    cause.to_dict().into_iter().collect();
                map.insert("cause".to_string(), serde_json::Value::Object(inner));
            }
            _ => {}
        }

        map
    }
}

impl From<std::io::Error> for TasklineError {
    fn from(err: std::io::Error) -> Self {
        Self::Runtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_stage_error_display() {
        let err = TasklineError::stage(2, anyhow!("boom"));
        assert_eq!(err.to_string(), "stage 2 failed: boom");
        assert_eq!(err.kind(), "StageFailure");
    }

    #[test]
    fn test_merge_error_wraps_cause() {
        let err = TasklineError::merge(1, TasklineError::stage(0, anyhow!("branch down")));

        assert!(err.to_string().contains("merge branch 1 failed"));
        assert_eq!(err.root_cause().map(ToString::to_string), Some("branch down".to_string()));
    }

    #[test]
    fn test_cancelled_has_no_root_cause() {
        let err = TasklineError::Cancelled;
        assert!(err.is_cancelled());
        assert!(err.root_cause().is_none());
    }

    #[test]
    fn test_error_to_dict() {
        let err = TasklineError::merge(3, TasklineError::stage(0, anyhow!("x")));
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "MergeFailure");
        assert_eq!(dict.get("branch").unwrap(), 3);
        assert_eq!(dict["cause"]["type"], "StageFailure");
    }

    #[test]
    fn test_clone_shares_cause() {
        let err = TasklineError::stage(0, anyhow!("shared"));
        let copy = err.clone();
        match (err, copy) {
            (TasklineError::Stage { cause: a, .. }, TasklineError::Stage { cause: b, .. }) => {
                assert!(Arc::ptr_eq(&a, &b));
            }
            _ => panic!("expected stage errors"),
        }
    }
}
