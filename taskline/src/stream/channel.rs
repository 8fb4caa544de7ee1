//! The streaming channel and its per-item scheduler.

use super::policy::DeliveryPolicy;
use crate::cancellation::{CancellationToken, FinishHook, LifecycleRegistry, ManagedWork};
use crate::dispatch::{Dispatcher, ExecutionContext};
use crate::errors::TasklineError;
use crate::pipeline::handle::{Callbacks, SuccessFn};
use crate::pipeline::run::{Run, RunSink};
use crate::pipeline::stage::Payload;
use crate::pipeline::{PipelineBuilder, Stage, WorkStarter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Builder mode for a channel fed with items of type `I`.
pub struct Streaming<I> {
    pub(crate) policy: DeliveryPolicy,
    _item: PhantomData<fn(I)>,
}

impl<I> Streaming<I> {
    pub(crate) fn new(policy: DeliveryPolicy) -> Self {
        Self {
            policy,
            _item: PhantomData,
        }
    }
}

impl<I> fmt::Debug for Streaming<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<I: Send + 'static, T: Send + 'static> PipelineBuilder<T, Streaming<I>> {
    /// Overrides the delivery policy.
    ///
    /// A pool of zero is raised to one, the smallest pool that makes
    /// progress.
    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        if policy == (DeliveryPolicy::Pooled { max_concurrency: 0 }) {
            warn!("Pooled delivery with max_concurrency 0; using 1");
        }
        self.mode.policy = policy.normalized();
        self
    }

    /// Opens the channel without a success callback.
    pub fn start(self) -> StreamChannel<I> {
        open(self, None)
    }
}

impl<I: Send + 'static, T: Send + 'static> WorkStarter<T, Streaming<I>> {
    /// Overrides the delivery policy.
    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.builder = self.builder.delivery_policy(policy);
        self
    }

    /// Opens the channel.
    pub fn start(self) -> StreamChannel<I> {
        open(self.builder, Some(self.success))
    }
}

fn open<I, T>(
    builder: PipelineBuilder<T, Streaming<I>>,
    success: Option<(ExecutionContext, SuccessFn<T>)>,
) -> StreamChannel<I>
where
    I: Send + 'static,
    T: Send + 'static,
{
    let (engine, chain, delay, callbacks, mode) = builder.into_parts(success);
    let inner = Arc::new(ChannelInner {
        id: Uuid::new_v4(),
        dispatcher: engine.dispatcher().clone(),
        chain,
        delay,
        policy: mode.policy,
        terminal: Arc::new(callbacks),
        token: Arc::new(CancellationToken::new()),
        state: Mutex::new(SchedState {
            pending: VecDeque::new(),
            in_flight: 0,
            current: None,
        }),
    });
    debug!(channel_id = %inner.id, policy = ?inner.policy, "Channel opened");
    StreamChannel { inner }
}

/// Terminal callbacks with the value type erased.
trait ItemTerminal: Send + Sync {
    fn success_context(&self) -> ExecutionContext;
    fn error_context(&self) -> ExecutionContext;
    fn deliver_value(&self, run_id: Uuid, value: Payload);
    fn deliver_fault(&self, run_id: Uuid, fault: &TasklineError);
}

impl<T: Send + 'static> ItemTerminal for Callbacks<T> {
    fn success_context(&self) -> ExecutionContext {
        self.success_context
    }

    fn error_context(&self) -> ExecutionContext {
        self.error_context
    }

    fn deliver_value(&self, run_id: Uuid, value: Payload) {
        match value.downcast::<T>() {
            Ok(value) => self.notify_success(run_id, &value),
            Err(_) => self.notify_error(
                run_id,
                &TasklineError::internal("channel produced a value of the wrong type"),
            ),
        }
    }

    fn deliver_fault(&self, run_id: Uuid, fault: &TasklineError) {
        self.notify_error(run_id, fault);
    }
}

struct SchedState<I> {
    pending: VecDeque<I>,
    in_flight: usize,
    /// Token of the item in flight under the exclusive policy.
    current: Option<Arc<CancellationToken>>,
}

struct ChannelInner<I> {
    id: Uuid,
    dispatcher: Dispatcher,
    chain: Arc<[Stage]>,
    delay: Duration,
    policy: DeliveryPolicy,
    terminal: Arc<dyn ItemTerminal>,
    token: Arc<CancellationToken>,
    state: Mutex<SchedState<I>>,
}

impl<I: Send + 'static> ChannelInner<I> {
    fn produce(self: &Arc<Self>, item: I) -> bool {
        let ready = {
            let mut state = self.state.lock();
            if self.token.is_cancelled() {
                return false;
            }
            if self.policy.is_exclusive() {
                if state.pending.pop_front().is_some() {
                    trace!(channel_id = %self.id, "Pending item replaced");
                }
                if let Some(current) = &state.current {
                    if current.cancel("superseded by a newer item") {
                        trace!(channel_id = %self.id, "In-flight item superseded");
                    }
                }
            }
            state.pending.push_back(item);
            self.take_ready(&mut state)
        };
        self.launch(ready);
        true
    }

    /// Moves pending items into flight while permits remain.
    fn take_ready(&self, state: &mut SchedState<I>) -> Vec<(I, Arc<CancellationToken>)> {
        let mut ready = Vec::new();
        while state.in_flight < self.policy.max_in_flight() {
            let Some(item) = state.pending.pop_front() else {
                break;
            };
            let token = Arc::new(CancellationToken::new());
            state.in_flight += 1;
            if self.policy.is_exclusive() {
                state.current = Some(token.clone());
            }
            ready.push((item, token));
        }
        ready
    }

    fn launch(self: &Arc<Self>, ready: Vec<(I, Arc<CancellationToken>)>) {
        for (item, token) in ready {
            let sink = Arc::new(ItemSink {
                channel: self.clone(),
                token: token.clone(),
            });
            let run = Arc::new(
                Run::new(self.dispatcher.clone(), self.chain.clone(), token, sink)
                    .with_scope(self.token.clone()),
            );
            trace!(channel_id = %self.id, run_id = %run.id(), "Item admitted");
            run.launch(
                self.delay,
                Box::new(move |run: Arc<Run>| run.advance(0, Box::new(item))),
            );
        }
    }

    fn item_finished(self: &Arc<Self>, token: &Arc<CancellationToken>) {
        let ready = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if state
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, token))
            {
                state.current = None;
            }
            if self.token.is_cancelled() {
                state.pending.clear();
                return;
            }
            self.take_ready(&mut state)
        };
        self.launch(ready);
    }

    fn cancel(&self, reason: &str) -> bool {
        let cancelled = self.token.cancel(reason);
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        if cancelled {
            debug!(channel_id = %self.id, dropped, reason, "Channel closed");
        }
        cancelled
    }
}

/// Routes one item's terminal outcome and returns its permit.
struct ItemSink<I> {
    channel: Arc<ChannelInner<I>>,
    token: Arc<CancellationToken>,
}

impl<I: Send + 'static> ItemSink<I> {
    /// Only `produce` cancels an item token, so a set token means a newer
    /// item took over. That holds even for NonCancellable callbacks.
    fn superseded(&self, run_id: Uuid) -> bool {
        if !self.token.is_cancelled() {
            return false;
        }
        trace!(
            channel_id = %self.channel.id,
            run_id = %run_id,
            "Superseded item dropped before delivery"
        );
        self.channel.item_finished(&self.token);
        true
    }
}

impl<I: Send + 'static> RunSink for ItemSink<I> {
    fn success_context(&self) -> ExecutionContext {
        self.channel.terminal.success_context()
    }

    fn error_context(&self) -> ExecutionContext {
        self.channel.terminal.error_context()
    }

    fn succeed(&self, run_id: Uuid, value: Payload) {
        if self.superseded(run_id) {
            return;
        }
        self.channel.terminal.deliver_value(run_id, value);
        self.channel.item_finished(&self.token);
    }

    fn fail(&self, run_id: Uuid, fault: TasklineError) {
        if self.superseded(run_id) {
            return;
        }
        debug!(channel_id = %self.channel.id, run_id = %run_id, kind = fault.kind(), "Item failed");
        self.channel.terminal.deliver_fault(run_id, &fault);
        self.channel.item_finished(&self.token);
    }

    fn discard(&self, run_id: Uuid, stage: usize) {
        trace!(channel_id = %self.channel.id, run_id = %run_id, stage, "Item filtered out");
        self.channel.item_finished(&self.token);
    }

    fn abandon(&self, run_id: Uuid) {
        trace!(channel_id = %self.channel.id, run_id = %run_id, "Item abandoned");
        self.channel.item_finished(&self.token);
    }
}

/// A started channel accepting items of type `I`.
///
/// Cloning yields another handle onto the same channel.
pub struct StreamChannel<I> {
    inner: Arc<ChannelInner<I>>,
}

impl<I> Clone for StreamChannel<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Send + 'static> StreamChannel<I> {
    /// Returns the channel id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the delivery policy.
    #[must_use]
    pub fn policy(&self) -> DeliveryPolicy {
        self.inner.policy
    }

    /// Submits one item. Returns false once the channel is closed.
    pub fn produce(&self, item: I) -> bool {
        self.inner.produce(item)
    }

    /// Stops admission and drops pending items; in-flight items abort at
    /// their next stage boundary.
    pub fn close(&self) {
        self.inner.cancel("channel closed");
    }

    /// Same as [`close`](Self::close); returns true on the first call.
    pub fn cancel(&self) -> bool {
        self.inner.cancel("channel cancelled")
    }

    /// True until the channel is closed or cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    /// Number of items currently traversing the chain.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Number of items waiting for a permit.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Registers this channel with `registry`.
    #[must_use]
    pub fn manage_by(self, registry: &LifecycleRegistry) -> Self {
        registry.add_active_work(&self);
        self
    }
}

impl<I: Send + 'static> ManagedWork for StreamChannel<I> {
    fn cancel(&self) -> bool {
        StreamChannel::cancel(self)
    }

    fn is_active(&self) -> bool {
        StreamChannel::is_active(self)
    }

    fn on_finished(&self, hook: FinishHook) {
        self.inner.token.on_cancel(hook);
    }
}

impl<I> fmt::Debug for StreamChannel<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.inner.id)
            .field("policy", &self.inner.policy)
            .field("active", &!self.inner.token.is_cancelled())
            .finish()
    }
}
