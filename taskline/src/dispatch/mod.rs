//! Execution contexts and the executors behind them.
//!
//! This module provides:
//! - ExecutionContext, the logical placement of a stage
//! - BackgroundPool, the bounded worker pool for background stages
//! - ForegroundLane, the single serialized lane for callbacks
//! - Dispatcher, which routes a job to the right executor
//! - FaultSink for faults nobody registered an error callback for

mod context;
mod dispatcher;
mod executor;
mod foreground;
mod sink;

pub use context::ExecutionContext;
pub use dispatcher::Dispatcher;
pub use executor::{BackgroundPool, Executor, Job};
pub use foreground::{ForegroundDispatcher, ForegroundLane};
pub(crate) use foreground::flush as flush_foreground;
pub use sink::{CollectingFaultSink, FaultSink, LoggingFaultSink};

#[cfg(test)]
pub use sink::MockFaultSink;
