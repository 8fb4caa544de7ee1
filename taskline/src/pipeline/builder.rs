//! Fluent construction of stage chains.

use super::handle::{Callbacks, Completion, ErrorFn, OneShotSink, PipelineHandle, SuccessFn};
use super::merge::Join;
use super::run::Run;
use super::stage::{Stage, StageKind};
use crate::cancellation::CancellationToken;
use crate::dispatch::ExecutionContext;
use crate::engine::Engine;
use crate::errors::TasklineError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Mode of a builder that starts a single run.
#[derive(Default)]
pub struct Single {
    pub(crate) join: Option<Join>,
}

impl fmt::Debug for Single {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Single")
            .field("merge", &self.join.is_some())
            .finish()
    }
}

/// Builds a chain of stages producing `T`.
///
/// `M` selects what `start()` returns: [`Single`] starts one run and yields
/// a [`PipelineHandle`]; [`Streaming`](crate::stream::Streaming) opens a
/// [`StreamChannel`](crate::stream::StreamChannel).
#[must_use = "a pipeline does nothing until it is started"]
pub struct PipelineBuilder<T, M = Single> {
    pub(crate) engine: Engine,
    pub(crate) stages: Vec<Stage>,
    pub(crate) delay: Duration,
    pub(crate) error: Option<(ExecutionContext, ErrorFn)>,
    pub(crate) mode: M,
    _value: PhantomData<fn() -> T>,
}

impl<T, M> PipelineBuilder<T, M>
where
    T: Send + 'static,
{
    pub(crate) fn with_stage(engine: Engine, stage: Stage, mode: M) -> Self {
        Self {
            engine,
            stages: vec![stage],
            delay: Duration::ZERO,
            error: None,
            mode,
            _value: PhantomData,
        }
    }

    fn append<B>(mut self, stage: Stage) -> PipelineBuilder<B, M> {
        self.stages.push(stage);
        PipelineBuilder {
            engine: self.engine,
            stages: self.stages,
            delay: self.delay,
            error: self.error,
            mode: self.mode,
            _value: PhantomData,
        }
    }

    fn default_context(&self) -> ExecutionContext {
        self.engine.config().default_stage_context
    }

    /// Appends a stage mapping the previous value.
    pub fn transform<B, F>(self, f: F) -> PipelineBuilder<B, M>
    where
        B: Send + 'static,
        F: Fn(T) -> B + Send + Sync + 'static,
    {
        let context = self.default_context();
        self.transform_in(context, f)
    }

    /// Appends a mapping stage running on `context`.
    pub fn transform_in<B, F>(self, context: ExecutionContext, f: F) -> PipelineBuilder<B, M>
    where
        B: Send + 'static,
        F: Fn(T) -> B + Send + Sync + 'static,
    {
        self.append(Stage::map(context, StageKind::Transform, move |value: T| {
            Ok(f(value))
        }))
    }

    /// Appends a mapping stage that may fail.
    pub fn try_transform<B, F>(self, f: F) -> PipelineBuilder<B, M>
    where
        B: Send + 'static,
        F: Fn(T) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        let context = self.default_context();
        self.try_transform_in(context, f)
    }

    /// Appends a fallible mapping stage running on `context`.
    pub fn try_transform_in<B, F>(self, context: ExecutionContext, f: F) -> PipelineBuilder<B, M>
    where
        B: Send + 'static,
        F: Fn(T) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        self.append(Stage::map(context, StageKind::Transform, f))
    }

    /// Appends a side-effect stage; the value passes through unchanged.
    pub fn consume<F>(self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let context = self.default_context();
        self.consume_in(context, f)
    }

    /// Appends a side-effect stage running on `context`.
    pub fn consume_in<F>(self, context: ExecutionContext, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.append(Stage::map(context, StageKind::Consume, move |value: T| {
            f(&value);
            Ok(value)
        }))
    }

    /// Appends a filter; rejected values end the run without a callback.
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let context = self.default_context();
        self.filter_in(context, predicate)
    }

    /// Appends a filter running on `context`.
    pub fn filter_in<F>(self, context: ExecutionContext, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.append(Stage::filter(context, predicate))
    }

    /// Delays the first stage by `delay`.
    pub fn set_start_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Registers the error callback on the default error context.
    pub fn on_error<F>(self, f: F) -> Self
    where
        F: Fn(&TasklineError) + Send + Sync + 'static,
    {
        let context = self.engine.config().default_error_context;
        self.on_error_in(context, f)
    }

    /// Registers the error callback on `context`.
    pub fn on_error_in<F>(mut self, context: ExecutionContext, f: F) -> Self
    where
        F: Fn(&TasklineError) + Send + Sync + 'static,
    {
        if self.error.replace((context, Arc::new(f))).is_some() {
            warn!("on_error registered twice; replacing the earlier callback");
        }
        self
    }

    /// Registers the success callback on the default success context.
    pub fn on_success<F>(self, f: F) -> WorkStarter<T, M>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let context = self.engine.config().default_success_context;
        self.on_success_in(context, f)
    }

    /// Registers the success callback on `context`.
    pub fn on_success_in<F>(self, context: ExecutionContext, f: F) -> WorkStarter<T, M>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        WorkStarter {
            builder: self,
            success: (context, Arc::new(f)),
        }
    }

    /// Returns the number of stages so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Freezes the chain and the callbacks.
    pub(crate) fn into_parts(
        self,
        success: Option<(ExecutionContext, SuccessFn<T>)>,
    ) -> (Engine, Arc<[Stage]>, Duration, Callbacks<T>, M) {
        let config = self.engine.config();
        let mut callbacks = Callbacks::new(
            config.default_success_context,
            config.default_error_context,
            self.engine.fault_sink().clone(),
        );
        if let Some((context, f)) = success {
            callbacks.set_success(context, f);
        }
        if let Some((context, f)) = self.error {
            callbacks.set_error(context, f);
        }
        (
            self.engine,
            self.stages.into(),
            self.delay,
            callbacks,
            self.mode,
        )
    }
}

impl<T: Send + 'static> PipelineBuilder<T, Single> {
    /// Starts the pipeline without a success callback.
    pub fn start(self) -> PipelineHandle<T> {
        self.launch(None)
    }

    fn launch(self, success: Option<(ExecutionContext, SuccessFn<T>)>) -> PipelineHandle<T> {
        let (engine, chain, delay, callbacks, mode) = self.into_parts(success);

        let token = Arc::new(CancellationToken::new());
        let completion = Arc::new(Completion::new());
        let sink = Arc::new(OneShotSink {
            callbacks,
            completion: completion.clone(),
        });
        let run = Arc::new(Run::new(
            engine.dispatcher().clone(),
            chain,
            token.clone(),
            sink,
        ));

        let handle = PipelineHandle::new(run.id(), token, completion);
        let entry = match mode.join {
            Some(join) => join.into_entry(),
            None => Run::from_start(),
        };
        run.launch(delay, entry);
        handle
    }
}

impl<T, M> fmt::Debug for PipelineBuilder<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("stages", &self.stages)
            .field("delay", &self.delay)
            .field("has_error", &self.error.is_some())
            .finish_non_exhaustive()
    }
}

/// A builder whose success callback is registered; only `start()` and
/// run-level settings remain.
#[must_use = "a pipeline does nothing until it is started"]
pub struct WorkStarter<T, M = Single> {
    pub(crate) builder: PipelineBuilder<T, M>,
    pub(crate) success: (ExecutionContext, SuccessFn<T>),
}

impl<T: Send + 'static, M> WorkStarter<T, M> {
    /// Registers the error callback on the default error context.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TasklineError) + Send + Sync + 'static,
    {
        self.builder = self.builder.on_error(f);
        self
    }

    /// Registers the error callback on `context`.
    pub fn on_error_in<F>(mut self, context: ExecutionContext, f: F) -> Self
    where
        F: Fn(&TasklineError) + Send + Sync + 'static,
    {
        self.builder = self.builder.on_error_in(context, f);
        self
    }

    /// Replaces the success callback.
    pub fn on_success<F>(self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let context = self.builder.engine.config().default_success_context;
        self.on_success_in(context, f)
    }

    /// Replaces the success callback, running it on `context`.
    pub fn on_success_in<F>(mut self, context: ExecutionContext, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        warn!("on_success registered twice; replacing the earlier callback");
        self.success = (context, Arc::new(f));
        self
    }

    /// Delays the first stage by `delay`.
    pub fn set_start_delay(mut self, delay: Duration) -> Self {
        self.builder = self.builder.set_start_delay(delay);
        self
    }
}

impl<T: Send + 'static> WorkStarter<T, Single> {
    /// Starts the pipeline.
    pub fn start(self) -> PipelineHandle<T> {
        self.builder.launch(Some(self.success))
    }
}

impl<T, M> fmt::Debug for WorkStarter<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStarter")
            .field("builder", &self.builder)
            .field("success_context", &self.success.0)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::CallbackProbe;
    use pretty_assertions::assert_eq;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_stage_count_tracks_chain() {
        let builder = engine()
            .create(|| 1)
            .transform(|x| x + 1)
            .consume(|_| {})
            .filter(|x| *x > 0);
        assert_eq!(builder.stage_count(), 4);
    }

    #[test]
    fn test_default_stage_context_from_config() {
        let engine =
            Engine::new(EngineConfig::default().with_default_stage_context(ExecutionContext::Foreground))
                .unwrap();
        let builder = engine.create(|| 1).transform(|x| x * 2);
        assert!(builder
            .stages
            .iter()
            .all(|stage| stage.context() == ExecutionContext::Foreground));
    }

    #[test]
    fn test_replaced_success_callback_wins() {
        let engine = engine();
        let first = CallbackProbe::<i32>::new();
        let second = CallbackProbe::<i32>::new();

        let handle = engine
            .create(|| 5)
            .on_success(first.success_fn())
            .on_success(second.success_fn())
            .start();

        assert_eq!(handle.get().unwrap(), 5);
        engine.flush_foreground(Duration::from_secs(2)).unwrap();
        assert_eq!(first.success_count(), 0);
        assert_eq!(second.values(), vec![5]);
    }

    #[test]
    fn test_replaced_error_callback_wins() {
        let engine = engine();
        let first = CallbackProbe::<i32>::new();
        let second = CallbackProbe::<i32>::new();

        let handle = engine
            .try_create(|| -> anyhow::Result<i32> { anyhow::bail!("no data") })
            .on_error(first.error_fn())
            .on_error(second.error_fn())
            .start();

        assert!(handle.get().is_err());
        engine.flush_foreground(Duration::from_secs(2)).unwrap();
        assert_eq!(first.error_count(), 0);
        assert_eq!(second.error_count(), 1);
    }

    #[test]
    fn test_error_callback_context_override() {
        let engine = engine();
        let probe = CallbackProbe::<i32>::new();

        let handle = engine
            .try_create(|| -> anyhow::Result<i32> { anyhow::bail!("no data") })
            .on_error_in(ExecutionContext::Background, probe.error_fn())
            .start();

        assert!(handle.get().is_err());
        let threads = probe.threads();
        assert_eq!(threads.len(), 1);
        assert!(threads[0].contains("background"));
    }
}
