//! Type-erased stage records.
//!
//! The builder is generic over the value flowing between stages; once a
//! chain is frozen every stage exchanges a boxed [`Payload`]. The builder's
//! types guarantee each downcast matches what the previous stage produced.

use crate::dispatch::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value travelling between two stages.
pub(crate) type Payload = Box<dyn Any + Send>;

/// The erased body of a stage.
pub(crate) type StageFn = Arc<dyn Fn(Payload) -> Step + Send + Sync>;

/// What a stage asks the run to do next.
pub(crate) enum Step {
    /// Hand the value to the next stage.
    Continue(Payload),
    /// A filter rejected the value; end the run without a callback.
    Discard,
    /// The stage function failed.
    Fault(anyhow::Error),
}

/// The role a stage plays in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Produces the first value of a run.
    Source,
    /// Maps a value to a new value.
    Transform,
    /// Observes a value and passes it on.
    Consume,
    /// Drops values failing a predicate.
    Filter,
    /// Combines the results of merge branches.
    Combine,
}

impl StageKind {
    /// Returns the snake_case name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Transform => "transform",
            Self::Consume => "consume",
            Self::Filter => "filter",
            Self::Combine => "combine",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One function plus the context it runs on.
#[derive(Clone)]
pub struct Stage {
    pub(crate) context: ExecutionContext,
    pub(crate) kind: StageKind,
    pub(crate) func: StageFn,
}

impl Stage {
    pub(crate) fn new(context: ExecutionContext, kind: StageKind, func: StageFn) -> Self {
        Self {
            context,
            kind,
            func,
        }
    }

    /// Returns the context the stage runs on.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Returns the stage kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Builds a stage mapping `A` to `B`.
    pub(crate) fn map<A, B, F>(context: ExecutionContext, kind: StageKind, f: F) -> Self
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(A) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        Self::new(
            context,
            kind,
            Arc::new(move |payload| match downcast::<A>(payload) {
                Ok(value) => match f(value) {
                    Ok(next) => Step::Continue(Box::new(next)),
                    Err(e) => Step::Fault(e),
                },
                Err(step) => step,
            }),
        )
    }

    /// Builds a stage that passes `A` through when `predicate` holds.
    pub(crate) fn filter<A, F>(context: ExecutionContext, predicate: F) -> Self
    where
        A: Send + 'static,
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        Self::new(
            context,
            StageKind::Filter,
            Arc::new(move |payload| match downcast::<A>(payload) {
                Ok(value) if predicate(&value) => Step::Continue(Box::new(value)),
                Ok(_) => Step::Discard,
                Err(step) => step,
            }),
        )
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("context", &self.context)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Unboxes a payload, turning a type mismatch into a fault.
pub(crate) fn downcast<A: 'static>(payload: Payload) -> Result<A, Step> {
    payload.downcast::<A>().map(|value| *value).map_err(|_| {
        Step::Fault(anyhow::anyhow!(
            "stage received a value that is not a {}",
            std::any::type_name::<A>()
        ))
    })
}

/// Extracts a readable message from a caught panic.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
