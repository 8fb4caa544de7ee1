//! Logical placement of a stage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a stage or terminal callback runs, and whether it honours
/// cancellation before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// The bounded background pool.
    #[default]
    Background,
    /// The single serialized foreground lane.
    Foreground,
    /// The background pool, skipping the pre-run cancellation check.
    NonCancellable,
}

impl ExecutionContext {
    /// Returns true if the stage must check the token before running.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        !matches!(self, Self::NonCancellable)
    }

    /// Returns true if work in this context runs on the background pool.
    #[must_use]
    pub const fn runs_on_background(self) -> bool {
        matches!(self, Self::Background | Self::NonCancellable)
    }

    /// Returns the snake_case name of the context.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Foreground => "foreground",
            Self::NonCancellable => "non_cancellable",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellable_flags() {
        assert!(ExecutionContext::Background.is_cancellable());
        assert!(ExecutionContext::Foreground.is_cancellable());
        assert!(!ExecutionContext::NonCancellable.is_cancellable());
    }

    #[test]
    fn test_background_placement() {
        assert!(ExecutionContext::Background.runs_on_background());
        assert!(ExecutionContext::NonCancellable.runs_on_background());
        assert!(!ExecutionContext::Foreground.runs_on_background());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ExecutionContext::NonCancellable).unwrap();
        assert_eq!(json, "\"non_cancellable\"");

        let parsed: ExecutionContext = serde_json::from_str("\"foreground\"").unwrap();
        assert_eq!(parsed, ExecutionContext::Foreground);
    }
}
