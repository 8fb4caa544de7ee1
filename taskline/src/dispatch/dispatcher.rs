//! Routes jobs to the executor bound to an execution context.

use super::context::ExecutionContext;
use super::executor::{Executor, Job};
use super::foreground::ForegroundDispatcher;
use std::sync::Arc;
use std::time::Duration;

/// Maps each [`ExecutionContext`] to the executor that runs it.
#[derive(Clone)]
pub struct Dispatcher {
    background: Arc<dyn Executor>,
    foreground: Arc<dyn ForegroundDispatcher>,
}

impl Dispatcher {
    /// Creates a dispatcher over a background executor and a foreground lane.
    #[must_use]
    pub fn new(background: Arc<dyn Executor>, foreground: Arc<dyn ForegroundDispatcher>) -> Self {
        Self {
            background,
            foreground,
        }
    }

    /// Schedules `job` on the executor for `context`.
    pub fn dispatch(&self, context: ExecutionContext, job: Job) {
        if context.runs_on_background() {
            self.background.submit(job);
        } else {
            self.foreground.post(job);
        }
    }

    /// Schedules `job` on the background pool after `delay`.
    ///
    /// A zero delay submits immediately.
    pub fn submit_after_delay(&self, job: Job, delay: Duration) {
        if delay.is_zero() {
            self.background.submit(job);
        } else {
            self.background.submit_after_delay(job, delay);
        }
    }

    /// Returns the background executor.
    #[must_use]
    pub fn background(&self) -> &Arc<dyn Executor> {
        &self.background
    }

    /// Returns the foreground dispatcher.
    #[must_use]
    pub fn foreground(&self) -> &Arc<dyn ForegroundDispatcher> {
        &self.foreground
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
