//! Fallback sink for faults that no `on_error` callback claimed.

use crate::errors::TasklineError;
use tracing::{error, warn, Level};

/// Receives faults from work that was started without an error callback.
///
/// Implementations must not panic; the engine calls them from worker and
/// foreground threads alike.
#[cfg_attr(test, mockall::automock)]
pub trait FaultSink: Send + Sync {
    /// Reports an unhandled fault.
    fn report(&self, fault: &TasklineError);
}

/// A fault sink that logs through the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingFaultSink {
    /// The log level to use.
    level: Level,
}

impl Default for LoggingFaultSink {
    fn default() -> Self {
        Self { level: Level::ERROR }
    }
}

impl LoggingFaultSink {
    /// Creates a new logging fault sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a warn-level logging sink.
    #[must_use]
    pub fn warn() -> Self {
        Self::new(Level::WARN)
    }
}

impl FaultSink for LoggingFaultSink {
    fn report(&self, fault: &TasklineError) {
        if self.level == Level::WARN {
            warn!(kind = fault.kind(), "Unhandled fault: {}", fault);
        } else {
            error!(kind = fault.kind(), "Unhandled fault: {}", fault);
        }
    }
}

/// A collecting fault sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingFaultSink {
    faults: parking_lot::RwLock<Vec<TasklineError>>,
}

impl CollectingFaultSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected faults.
    #[must_use]
    pub fn faults(&self) -> Vec<TasklineError> {
        self.faults.read().clone()
    }

    /// Returns the number of collected faults.
    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.read().len()
    }

    /// Returns true if nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.read().is_empty()
    }

    /// Clears all collected faults.
    pub fn clear(&self) {
        self.faults.write().clear();
    }
}

impl FaultSink for CollectingFaultSink {
    fn report(&self, fault: &TasklineError) {
        self.faults.write().push(fault.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_logging_sink_does_not_panic() {
        let sink = LoggingFaultSink::default();
        sink.report(&TasklineError::stage(0, anyhow!("unhandled")));
        LoggingFaultSink::warn().report(&TasklineError::Cancelled);
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingFaultSink::new();
        assert!(sink.is_empty());

        sink.report(&TasklineError::stage(1, anyhow!("first")));
        sink.report(&TasklineError::internal("second"));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.faults()[0].kind(), "StageFailure");

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_mock_sink_expectation() {
        let mut mock = MockFaultSink::new();
        mock.expect_report()
            .withf(|fault| fault.kind() == "MergeFailure")
            .times(1)
            .return_const(());

        mock.report(&TasklineError::merge(0, TasklineError::internal("x")));
    }
}
