//! Completion tracking and the handle returned by `start()`.

use super::run::RunSink;
use super::stage::{panic_message, Payload};
use crate::cancellation::{CancellationToken, FinishHook, LifecycleRegistry, ManagedWork};
use crate::dispatch::{ExecutionContext, FaultSink};
use crate::errors::{Result, TasklineError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Success callback.
pub(crate) type SuccessFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Error callback.
pub(crate) type ErrorFn = Arc<dyn Fn(&TasklineError) + Send + Sync>;

/// Terminal callbacks of a pipeline or channel, plus where they run.
pub(crate) struct Callbacks<T> {
    pub(crate) success: Option<SuccessFn<T>>,
    pub(crate) success_context: ExecutionContext,
    pub(crate) error: Option<ErrorFn>,
    pub(crate) error_context: ExecutionContext,
    pub(crate) fault_sink: Arc<dyn FaultSink>,
}

impl<T> Callbacks<T> {
    pub(crate) fn new(
        success_context: ExecutionContext,
        error_context: ExecutionContext,
        fault_sink: Arc<dyn FaultSink>,
    ) -> Self {
        Self {
            success: None,
            success_context,
            error: None,
            error_context,
            fault_sink,
        }
    }

    pub(crate) fn set_success(&mut self, context: ExecutionContext, callback: SuccessFn<T>) {
        self.success = Some(callback);
        self.success_context = context;
    }

    pub(crate) fn set_error(&mut self, context: ExecutionContext, callback: ErrorFn) {
        self.error = Some(callback);
        self.error_context = context;
    }

    /// Invokes the success callback, if any.
    pub(crate) fn notify_success(&self, run_id: Uuid, value: &T) {
        if let Some(callback) = &self.success {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
                self.report_callback_panic(run_id, "on_success", panic.as_ref());
            }
        }
    }

    /// Invokes the error callback, or the fault sink if none was registered.
    pub(crate) fn notify_error(&self, run_id: Uuid, fault: &TasklineError) {
        match &self.error {
            Some(callback) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(fault))) {
                    self.report_callback_panic(run_id, "on_error", panic.as_ref());
                }
            }
            None => self.fault_sink.report(fault),
        }
    }

    fn report_callback_panic(&self, run_id: Uuid, callback: &str, panic: &(dyn std::any::Any + Send)) {
        let message = panic_message(panic);
        warn!(run_id = %run_id, callback, "Callback panicked: {}", message);
        self.fault_sink
            .report(&TasklineError::internal(format!("{callback} panicked: {message}")));
    }
}

impl<T> fmt::Debug for Callbacks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("has_success", &self.success.is_some())
            .field("success_context", &self.success_context)
            .field("has_error", &self.error.is_some())
            .field("error_context", &self.error_context)
            .finish()
    }
}

/// How a pipeline ended.
#[derive(Debug, Clone)]
pub(crate) enum Outcome<T> {
    Succeeded(T),
    Failed(TasklineError),
    Cancelled,
    Discarded(usize),
}

enum Phase<T> {
    Pending,
    /// A terminal callback is running; cancel no longer applies.
    Delivering,
    Done(Outcome<T>),
}

struct Slot<T> {
    phase: Phase<T>,
    settled: bool,
    hooks: Vec<FinishHook>,
}

/// Single-assignment terminal state shared by a handle and its run.
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                phase: Phase::Pending,
                settled: false,
                hooks: Vec::new(),
            }),
            settled: Condvar::new(),
        }
    }

    /// Claims the right to run a terminal callback.
    pub(crate) fn begin_delivery(&self) -> bool {
        let mut slot = self.slot.lock();
        if matches!(slot.phase, Phase::Pending) {
            slot.phase = Phase::Delivering;
            true
        } else {
            false
        }
    }

    /// Moves a pending completion to Cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let hooks = {
            let mut slot = self.slot.lock();
            if !matches!(slot.phase, Phase::Pending) {
                return false;
            }
            slot.phase = Phase::Done(Outcome::Cancelled);
            std::mem::take(&mut slot.hooks)
        };
        self.settle(hooks);
        true
    }

    /// Records the outcome unless one is already recorded.
    pub(crate) fn finish(&self, outcome: Outcome<T>) -> bool {
        let hooks = {
            let mut slot = self.slot.lock();
            if matches!(slot.phase, Phase::Done(_)) {
                return false;
            }
            slot.phase = Phase::Done(outcome);
            std::mem::take(&mut slot.hooks)
        };
        self.settle(hooks);
        true
    }

    // Hooks run before waiters wake so `get()` never observes a handle
    // that is still registered.
    fn settle(&self, hooks: Vec<FinishHook>) {
        for hook in hooks {
            hook();
        }
        self.slot.lock().settled = true;
        self.settled.notify_all();
    }

    /// Runs `hook` once an outcome is recorded, immediately if it already is.
    pub(crate) fn on_finished(&self, hook: FinishHook) {
        {
            let mut slot = self.slot.lock();
            if !matches!(slot.phase, Phase::Done(_)) {
                slot.hooks.push(hook);
                return;
            }
        }
        hook();
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.slot.lock().phase, Phase::Done(_))
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.slot.lock().settled
    }
}

impl<T: Clone> Completion<T> {
    /// Blocks until settled or until `deadline` passes.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Option<Outcome<T>> {
        let mut slot = self.slot.lock();
        while !slot.settled {
            match deadline {
                Some(deadline) => {
                    if self.settled.wait_until(&mut slot, deadline).timed_out() && !slot.settled {
                        return None;
                    }
                }
                None => self.settled.wait(&mut slot),
            }
        }
        match &slot.phase {
            Phase::Done(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }
}

/// Sink for a one-shot pipeline: callbacks plus the completion slot.
pub(crate) struct OneShotSink<T> {
    pub(crate) callbacks: Callbacks<T>,
    pub(crate) completion: Arc<Completion<T>>,
}

impl<T: Send + 'static> RunSink for OneShotSink<T> {
    fn success_context(&self) -> ExecutionContext {
        self.callbacks.success_context
    }

    fn error_context(&self) -> ExecutionContext {
        self.callbacks.error_context
    }

    fn succeed(&self, run_id: Uuid, value: Payload) {
        if !self.completion.begin_delivery() {
            return;
        }
        match value.downcast::<T>() {
            Ok(value) => {
                self.callbacks.notify_success(run_id, &value);
                self.completion.finish(Outcome::Succeeded(*value));
            }
            Err(_) => {
                let fault = TasklineError::internal("pipeline produced a value of the wrong type");
                self.callbacks.notify_error(run_id, &fault);
                self.completion.finish(Outcome::Failed(fault));
            }
        }
        debug!(run_id = %run_id, "Pipeline completed");
    }

    fn fail(&self, run_id: Uuid, fault: TasklineError) {
        if !self.completion.begin_delivery() {
            return;
        }
        debug!(run_id = %run_id, kind = fault.kind(), "Pipeline failed");
        self.callbacks.notify_error(run_id, &fault);
        self.completion.finish(Outcome::Failed(fault));
    }

    fn discard(&self, _run_id: Uuid, stage: usize) {
        self.completion.finish(Outcome::Discarded(stage));
    }

    fn abandon(&self, run_id: Uuid) {
        if self.completion.finish(Outcome::Cancelled) {
            debug!(run_id = %run_id, "Pipeline abandoned");
        }
    }
}

/// Handle to a started pipeline.
///
/// Cloning yields another handle to the same run.
pub struct PipelineHandle<T> {
    id: Uuid,
    token: Arc<CancellationToken>,
    completion: Arc<Completion<T>>,
}

impl<T> Clone for PipelineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            token: self.token.clone(),
            completion: self.completion.clone(),
        }
    }
}

impl<T: Send + 'static> PipelineHandle<T> {
    pub(crate) fn new(id: Uuid, token: Arc<CancellationToken>, completion: Arc<Completion<T>>) -> Self {
        Self {
            id,
            token,
            completion,
        }
    }

    /// Returns the run id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancels the pipeline.
    ///
    /// Returns true if this call prevented the terminal callback. A stage
    /// already running finishes, but no later stage starts.
    pub fn cancel(&self) -> bool {
        let won = self.completion.cancel();
        self.token.cancel("cancelled by handle");
        if won {
            debug!(run_id = %self.id, "Pipeline cancelled");
        }
        won
    }

    /// True until the pipeline reaches a terminal state or is cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.completion.is_done()
    }

    /// True once the pipeline has reached any terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completion.is_settled()
    }

    /// Registers this pipeline with `registry`.
    #[must_use]
    pub fn manage_by(self, registry: &LifecycleRegistry) -> Self {
        registry.add_active_work(&self);
        self
    }
}

impl<T: Clone + Send + 'static> PipelineHandle<T> {
    /// Blocks until the pipeline ends and returns its value.
    ///
    /// Never call this from the foreground lane while the pipeline still
    /// needs that lane to deliver its callback.
    pub fn get(&self) -> Result<T> {
        match self.completion.wait(None) {
            Some(outcome) => outcome_to_result(outcome),
            None => Err(TasklineError::internal("completion settled without an outcome")),
        }
    }

    /// Like [`get`](Self::get), giving up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        match self.completion.wait(Some(Instant::now() + timeout)) {
            Some(outcome) => outcome_to_result(outcome),
            None => Err(TasklineError::Timeout(timeout)),
        }
    }
}

fn outcome_to_result<T>(outcome: Outcome<T>) -> Result<T> {
    match outcome {
        Outcome::Succeeded(value) => Ok(value),
        Outcome::Failed(fault) => Err(fault),
        Outcome::Cancelled => Err(TasklineError::Cancelled),
        Outcome::Discarded(stage) => Err(TasklineError::Discarded { stage }),
    }
}

impl<T: Send + 'static> ManagedWork for PipelineHandle<T> {
    fn cancel(&self) -> bool {
        PipelineHandle::cancel(self)
    }

    fn is_active(&self) -> bool {
        PipelineHandle::is_active(self)
    }

    fn on_finished(&self, hook: FinishHook) {
        self.completion.on_finished(hook);
    }
}

impl<T> fmt::Debug for PipelineHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CollectingFaultSink;
    use pretty_assertions::assert_eq;

    fn handle() -> (PipelineHandle<i32>, Arc<Completion<i32>>) {
        let completion = Arc::new(Completion::new());
        let handle = PipelineHandle::new(
            Uuid::new_v4(),
            Arc::new(CancellationToken::new()),
            completion.clone(),
        );
        (handle, completion)
    }

    fn sink(completion: Arc<Completion<i32>>) -> (OneShotSink<i32>, Arc<Mutex<Vec<String>>>, Arc<CollectingFaultSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let faults = Arc::new(CollectingFaultSink::new());
        let mut callbacks = Callbacks::new(
            ExecutionContext::Foreground,
            ExecutionContext::Foreground,
            faults.clone(),
        );
        let seen_ok = seen.clone();
        callbacks.set_success(
            ExecutionContext::Foreground,
            Arc::new(move |v: &i32| seen_ok.lock().push(format!("ok:{v}"))),
        );
        let seen_err = seen.clone();
        callbacks.set_error(
            ExecutionContext::Foreground,
            Arc::new(move |e: &TasklineError| seen_err.lock().push(format!("err:{}", e.kind()))),
        );
        (OneShotSink { callbacks, completion }, seen, faults)
    }

    #[test]
    fn test_success_then_get() {
        let (handle, completion) = handle();
        let (sink, seen, _) = sink(completion);

        assert!(handle.is_active());
        sink.succeed(handle.id(), Box::new(7));

        assert_eq!(handle.get().unwrap(), 7);
        assert_eq!(*seen.lock(), vec!["ok:7"]);
        assert!(handle.is_completed());
        assert!(!handle.is_active());
    }

    #[test]
    fn test_cancel_suppresses_delivery() {
        let (handle, completion) = handle();
        let (sink, seen, _) = sink(completion);

        assert!(handle.cancel());
        assert!(!handle.cancel());
        sink.succeed(handle.id(), Box::new(7));

        assert!(seen.lock().is_empty());
        assert!(handle.get().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_cancel_after_delivery_started_is_ignored() {
        let (handle, completion) = handle();
        assert!(completion.begin_delivery());

        assert!(!handle.cancel());
        completion.finish(Outcome::Succeeded(1));
        assert_eq!(handle.get().unwrap(), 1);
    }

    #[test]
    fn test_failure_reaches_error_callback() {
        let (handle, completion) = handle();
        let (sink, seen, faults) = sink(completion);

        sink.fail(handle.id(), TasklineError::stage(0, anyhow::anyhow!("bad")));

        assert_eq!(*seen.lock(), vec!["err:StageFailure"]);
        assert!(faults.is_empty());
        assert_eq!(handle.get().unwrap_err().kind(), "StageFailure");
    }

    #[test]
    fn test_unclaimed_failure_goes_to_fault_sink() {
        let completion = Arc::new(Completion::<i32>::new());
        let faults = Arc::new(CollectingFaultSink::new());
        let sink = OneShotSink {
            callbacks: Callbacks::new(
                ExecutionContext::Foreground,
                ExecutionContext::Foreground,
                faults.clone(),
            ),
            completion,
        };

        sink.fail(Uuid::new_v4(), TasklineError::internal("lost"));
        assert_eq!(faults.len(), 1);
    }

    #[test]
    fn test_panicking_callback_is_reported() {
        let completion = Arc::new(Completion::<i32>::new());
        let faults = Arc::new(CollectingFaultSink::new());
        let mut callbacks = Callbacks::new(
            ExecutionContext::Foreground,
            ExecutionContext::Foreground,
            faults.clone(),
        );
        callbacks.set_success(ExecutionContext::Foreground, Arc::new(|_: &i32| panic!("ui gone")));
        let sink = OneShotSink {
            callbacks,
            completion: completion.clone(),
        };

        sink.succeed(Uuid::new_v4(), Box::new(1));

        assert_eq!(faults.faults()[0].kind(), "Internal");
        assert!(completion.is_settled());
    }

    #[test]
    fn test_discard_and_timeout() {
        let (handle, completion) = handle();
        assert!(matches!(
            handle.get_timeout(Duration::from_millis(20)),
            Err(TasklineError::Timeout(_))
        ));

        let (sink, seen, _) = sink(completion);
        sink.discard(handle.id(), 2);
        assert!(seen.lock().is_empty());
        assert!(matches!(handle.get(), Err(TasklineError::Discarded { stage: 2 })));
    }

    #[test]
    fn test_manage_by_deregisters_on_finish() {
        let registry = LifecycleRegistry::new();
        let (handle, completion) = handle();
        let handle = handle.manage_by(&registry);

        assert!(registry.has_active_works());
        completion.finish(Outcome::Succeeded(3));
        assert!(!registry.has_active_works());
        assert_eq!(handle.get().unwrap(), 3);
    }

    #[test]
    fn test_get_waits_for_other_thread() {
        let (handle, completion) = handle();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            completion.finish(Outcome::Succeeded(42));
        });

        assert_eq!(handle.get_timeout(Duration::from_secs(2)).unwrap(), 42);
        worker.join().unwrap();
    }
}
