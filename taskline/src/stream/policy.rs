//! How a channel admits produced items.

use serde::{Deserialize, Serialize};

/// Scheduling policy of a [`StreamChannel`](super::StreamChannel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum DeliveryPolicy {
    /// One item in flight; a newer item replaces the pending one and
    /// supersedes the one in flight.
    #[default]
    Exclusive,
    /// Up to `max_concurrency` items in flight, in no particular order.
    Pooled {
        /// Maximum number of items traversing the chain at once. Zero is
        /// treated as one.
        max_concurrency: usize,
    },
}

impl DeliveryPolicy {
    /// Returns the policy with a zero-sized pool raised to one.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Pooled { max_concurrency: 0 } => Self::Pooled { max_concurrency: 1 },
            other => other,
        }
    }

    /// Returns the number of items allowed in flight, at least one.
    #[must_use]
    pub fn max_in_flight(self) -> usize {
        match self {
            Self::Exclusive => 1,
            Self::Pooled { max_concurrency } => max_concurrency.max(1),
        }
    }

    /// Returns true for the last-writer-wins policy.
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}
