//! The engine: executors, configuration and the builder entry points.

use crate::config::EngineConfig;
use crate::dispatch::{
    self, BackgroundPool, Dispatcher, Executor, ForegroundDispatcher, ForegroundLane, FaultSink,
    LoggingFaultSink,
};
use crate::errors::Result;
use crate::pipeline::merge::{branch, MergeAll, MergeWorks2, MergeWorks3, MergeWorks4};
use crate::pipeline::{PipelineBuilder, Single, Stage, StageKind};
use crate::stream::{DeliveryPolicy, Streaming};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct EngineInner {
    config: EngineConfig,
    dispatcher: Dispatcher,
    fault_sink: Arc<dyn FaultSink>,
}

/// Entry point for building pipelines, merges and channels.
///
/// Cloning is cheap; every clone shares the same executors.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Builds an engine with a [`BackgroundPool`] and a [`ForegroundLane`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a thread cannot
    /// be spawned.
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    /// Starts building an engine with custom executors.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn fault_sink(&self) -> &Arc<dyn FaultSink> {
        &self.inner.fault_sink
    }

    /// Starts a pipeline whose first stage computes a value.
    pub fn create<T, F>(&self, f: F) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.try_create(move || Ok(f()))
    }

    /// Starts a pipeline whose first stage may fail.
    pub fn try_create<T, F>(&self, f: F) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let cell = Mutex::new(Some(f));
        let stage = Stage::map(
            self.config().default_stage_context,
            StageKind::Source,
            move |(): ()| {
                let f = cell.lock().take();
                match f {
                    Some(f) => f(),
                    None => Err(anyhow::anyhow!("source stage already ran")),
                }
            },
        );
        PipelineBuilder::with_stage(self.clone(), stage, Single::default())
    }

    /// Runs two computations concurrently and waits for both.
    pub fn merge_works<A, B, FA, FB>(&self, a: FA, b: FB) -> MergeWorks2<A, B>
    where
        A: Send + 'static,
        B: Send + 'static,
        FA: FnOnce() -> anyhow::Result<A> + Send + 'static,
        FB: FnOnce() -> anyhow::Result<B> + Send + 'static,
    {
        MergeWorks2::new(self.clone(), vec![branch(a), branch(b)])
    }

    /// Runs three computations concurrently and waits for all of them.
    pub fn merge_works3<A, B, C, FA, FB, FC>(&self, a: FA, b: FB, c: FC) -> MergeWorks3<A, B, C>
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
        FA: FnOnce() -> anyhow::Result<A> + Send + 'static,
        FB: FnOnce() -> anyhow::Result<B> + Send + 'static,
        FC: FnOnce() -> anyhow::Result<C> + Send + 'static,
    {
        MergeWorks3::new(self.clone(), vec![branch(a), branch(b), branch(c)])
    }

    /// Runs four computations concurrently and waits for all of them.
    #[allow(clippy::many_single_char_names)]
    pub fn merge_works4<A, B, C, D, FA, FB, FC, FD>(
        &self,
        a: FA,
        b: FB,
        c: FC,
        d: FD,
    ) -> MergeWorks4<A, B, C, D>
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
        D: Send + 'static,
        FA: FnOnce() -> anyhow::Result<A> + Send + 'static,
        FB: FnOnce() -> anyhow::Result<B> + Send + 'static,
        FC: FnOnce() -> anyhow::Result<C> + Send + 'static,
        FD: FnOnce() -> anyhow::Result<D> + Send + 'static,
    {
        MergeWorks4::new(
            self.clone(),
            vec![branch(a), branch(b), branch(c), branch(d)],
        )
    }

    /// Runs any number of same-typed computations and waits for all.
    pub fn merge_all<A, F, I>(&self, branches: I) -> MergeAll<A>
    where
        A: Send + 'static,
        F: FnOnce() -> anyhow::Result<A> + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        MergeAll::new(self.clone(), branches.into_iter().map(branch::<A, F>).collect())
    }

    /// Builds a channel that feeds each produced item to `f`, one item at
    /// a time, keeping only the latest pending item.
    pub fn consume_by<I, T, F>(&self, f: F) -> PipelineBuilder<T, Streaming<I>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> T + Send + Sync + 'static,
    {
        self.try_consume_by(move |item| Ok(f(item)))
    }

    /// Like [`consume_by`](Self::consume_by) with a fallible first stage.
    pub fn try_consume_by<I, T, F>(&self, f: F) -> PipelineBuilder<T, Streaming<I>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let stage = Stage::map(self.config().default_stage_context, StageKind::Source, f);
        PipelineBuilder::with_stage(
            self.clone(),
            stage,
            Streaming::new(DeliveryPolicy::Exclusive),
        )
    }

    /// Builds a channel processing up to `pool_consumers` items at once.
    pub fn consume_by_pool<I, T, F>(&self, f: F) -> PipelineBuilder<T, Streaming<I>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> T + Send + Sync + 'static,
    {
        let policy = DeliveryPolicy::Pooled {
            max_concurrency: self.config().pool_consumers,
        };
        self.consume_by(f).delivery_policy(policy)
    }

    /// Blocks until every job already posted to the foreground has run.
    ///
    /// # Errors
    ///
    /// Returns [`TasklineError::Timeout`](crate::TasklineError::Timeout)
    /// if the foreground does not drain in time.
    pub fn flush_foreground(&self, timeout: Duration) -> Result<()> {
        dispatch::flush_foreground(self.inner.dispatcher.foreground().as_ref(), timeout)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for an [`Engine`] with host-supplied executors.
#[must_use]
pub struct EngineBuilder {
    config: EngineConfig,
    background: Option<Arc<dyn Executor>>,
    foreground: Option<Arc<dyn ForegroundDispatcher>>,
    fault_sink: Option<Arc<dyn FaultSink>>,
}

impl EngineBuilder {
    /// Creates a builder with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            background: None,
            foreground: None,
            fault_sink: None,
        }
    }

    /// Uses `executor` instead of a [`BackgroundPool`].
    pub fn with_background(mut self, executor: Arc<dyn Executor>) -> Self {
        self.background = Some(executor);
        self
    }

    /// Uses `dispatcher` (e.g. a UI event loop) instead of a [`ForegroundLane`].
    pub fn with_foreground(mut self, dispatcher: Arc<dyn ForegroundDispatcher>) -> Self {
        self.foreground = Some(dispatcher);
        self
    }

    /// Routes unclaimed faults to `sink` instead of the log.
    pub fn with_fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = Some(sink);
        self
    }

    /// Validates the configuration and spawns any missing executors.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a thread cannot
    /// be spawned.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let prefix = self.config.thread_name_prefix.as_str();

        let background: Arc<dyn Executor> = match self.background {
            Some(executor) => executor,
            None => Arc::new(BackgroundPool::new(self.config.background_threads, prefix)?),
        };
        let foreground: Arc<dyn ForegroundDispatcher> = match self.foreground {
            Some(dispatcher) => dispatcher,
            None => Arc::new(ForegroundLane::spawn(prefix)?),
        };
        let fault_sink = self
            .fault_sink
            .unwrap_or_else(|| Arc::new(LoggingFaultSink::default()));

        debug!(
            background_threads = self.config.background_threads,
            pool_consumers = self.config.pool_consumers,
            "Engine started"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                dispatcher: Dispatcher::new(background, foreground),
                fault_sink,
            }),
        })
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("custom_background", &self.background.is_some())
            .field("custom_foreground", &self.foreground.is_some())
            .field("custom_fault_sink", &self.fault_sink.is_some())
            .finish()
    }
}
