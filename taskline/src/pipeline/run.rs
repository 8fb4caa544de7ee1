//! Continuation-passing execution of a frozen stage chain.
//!
//! A [`Run`] never blocks between stages. Each stage, when it returns,
//! dispatches the next one onto that stage's context; the last stage
//! dispatches the terminal callback. Cancellation is observed at every
//! boundary.

use super::stage::{panic_message, Payload, Stage, Step};
use crate::cancellation::CancellationToken;
use crate::dispatch::{Dispatcher, ExecutionContext};
use crate::errors::TasklineError;
use crate::observability::SpanTimer;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// Receives the single terminal outcome of a run.
///
/// Exactly one of these methods is called per run. `succeed` and `fail`
/// are called on the context the sink names for them.
pub(crate) trait RunSink: Send + Sync {
    fn success_context(&self) -> ExecutionContext;
    fn error_context(&self) -> ExecutionContext;
    fn succeed(&self, run_id: Uuid, value: Payload);
    fn fail(&self, run_id: Uuid, fault: TasklineError);
    fn discard(&self, run_id: Uuid, stage: usize);
    fn abandon(&self, run_id: Uuid);
}

/// Starts a run; the default entry feeds `()` to stage 0.
pub(crate) type Entry = Box<dyn FnOnce(Arc<Run>) + Send>;

/// One traversal of a chain.
pub(crate) struct Run {
    id: Uuid,
    dispatcher: Dispatcher,
    chain: Arc<[Stage]>,
    token: Arc<CancellationToken>,
    scope: Option<Arc<CancellationToken>>,
    sink: Arc<dyn RunSink>,
}

impl Run {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        chain: Arc<[Stage]>,
        token: Arc<CancellationToken>,
        sink: Arc<dyn RunSink>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dispatcher,
            chain,
            token,
            scope: None,
            sink,
        }
    }

    /// Also abort when `scope` is cancelled.
    pub(crate) fn with_scope(mut self, scope: Arc<CancellationToken>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.scope.as_ref().is_some_and(|s| s.is_cancelled())
    }

    /// Runs `entry` now, or after `delay` unless cancelled first.
    pub(crate) fn launch(self: Arc<Self>, delay: Duration, entry: Entry) {
        debug!(run_id = %self.id, stages = self.chain.len(), ?delay, "Run started");

        if delay.is_zero() {
            entry(self);
            return;
        }

        let run = self.clone();
        self.dispatcher.submit_after_delay(
            Box::new(move || {
                if run.is_cancelled() {
                    debug!(run_id = %run.id, "Run cancelled during start delay");
                    run.sink.abandon(run.id);
                } else {
                    entry(run);
                }
            }),
            delay,
        );
    }

    /// Entry feeding `()` to stage 0.
    pub(crate) fn from_start() -> Entry {
        Box::new(|run: Arc<Run>| run.advance(0, Box::new(())))
    }

    /// Dispatches stage `index`, or the success callback past the end.
    pub(crate) fn advance(self: &Arc<Self>, index: usize, payload: Payload) {
        let Some(stage) = self.chain.get(index) else {
            self.deliver_success(payload);
            return;
        };

        trace!(run_id = %self.id, stage = index, context = %stage.context, "Dispatching stage");
        let run = self.clone();
        self.dispatcher
            .dispatch(stage.context, Box::new(move || run.run_stage(index, payload)));
    }

    fn run_stage(self: &Arc<Self>, index: usize, payload: Payload) {
        let stage = &self.chain[index];

        if stage.context.is_cancellable() && self.is_cancelled() {
            debug!(run_id = %self.id, stage = index, "Run cancelled before stage");
            self.sink.abandon(self.id);
            return;
        }

        let timer = SpanTimer::start(format!("stage-{index}"));
        let func = stage.func.clone();
        let step = catch_unwind(AssertUnwindSafe(move || func(payload)));
        trace!(
            run_id = %self.id,
            stage = index,
            kind = %stage.kind,
            duration_ms = timer.finish(),
            "Stage finished"
        );

        match step {
            Ok(Step::Continue(next)) => self.advance(index + 1, next),
            Ok(Step::Discard) => {
                debug!(run_id = %self.id, stage = index, "Value discarded by filter");
                self.sink.discard(self.id, index);
            }
            Ok(Step::Fault(cause)) => self.deliver_error(TasklineError::stage(index, cause)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.deliver_error(TasklineError::stage(
                    index,
                    anyhow::anyhow!("stage panicked: {message}"),
                ));
            }
        }
    }

    fn deliver_success(self: &Arc<Self>, value: Payload) {
        let context = self.sink.success_context();
        let run = self.clone();
        self.dispatcher.dispatch(
            context,
            Box::new(move || {
                if context.is_cancellable() && run.is_cancelled() {
                    debug!(run_id = %run.id, "Success suppressed by cancellation");
                    run.sink.abandon(run.id);
                } else {
                    run.sink.succeed(run.id, value);
                }
            }),
        );
    }

    /// Dispatches `fault` to the error callback's context.
    pub(crate) fn deliver_error(self: &Arc<Self>, fault: TasklineError) {
        let context = self.sink.error_context();
        let run = self.clone();
        self.dispatcher.dispatch(
            context,
            Box::new(move || {
                if context.is_cancellable() && run.is_cancelled() {
                    debug!(run_id = %run.id, "Error suppressed by cancellation");
                    run.sink.abandon(run.id);
                } else {
                    run.sink.fail(run.id, fault);
                }
            }),
        );
    }

    /// Ends the run without a callback.
    pub(crate) fn abandon(&self) {
        self.sink.abandon(self.id);
    }
}
