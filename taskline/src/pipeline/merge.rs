//! Fan-in of independent computations.
//!
//! Each branch runs on the background pool. A counting latch collects the
//! results; the last branch to finish hands them to the combiner, which is
//! stage 0 of an ordinary pipeline. The first failing branch cancels the
//! others and fails the pipeline.

use super::builder::{PipelineBuilder, Single};
use super::run::{Entry, Run};
use super::stage::{downcast, panic_message, Payload, Stage, StageKind, Step};
use crate::cancellation::CancellationToken;
use crate::dispatch::ExecutionContext;
use crate::engine::Engine;
use crate::errors::TasklineError;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The erased body of one merge branch.
pub(crate) type BranchFn = Box<dyn FnOnce() -> anyhow::Result<Payload> + Send>;

pub(crate) fn branch<A, F>(f: F) -> BranchFn
where
    A: Send + 'static,
    F: FnOnce() -> anyhow::Result<A> + Send + 'static,
{
    Box::new(move || f().map(|value| Box::new(value) as Payload))
}

/// Branches waiting to be started with their pipeline.
pub(crate) struct Join {
    branches: Vec<BranchFn>,
}

impl Join {
    pub(crate) fn new(branches: Vec<BranchFn>) -> Self {
        Self { branches }
    }

    /// Entry that starts every branch instead of stage 0.
    pub(crate) fn into_entry(self) -> Entry {
        Box::new(move |run: Arc<Run>| self.start(run))
    }

    fn start(self, run: Arc<Run>) {
        let count = self.branches.len();
        if count == 0 {
            run.advance(0, Box::new(Vec::<Payload>::new()));
            return;
        }

        let ctx = Arc::new(JoinCtx {
            run,
            results: Mutex::new((0..count).map(|_| None).collect()),
            remaining: AtomicUsize::new(count),
            failed: AtomicBool::new(false),
            group: CancellationToken::new(),
        });

        for (index, branch) in self.branches.into_iter().enumerate() {
            let job_ctx = ctx.clone();
            ctx.run.dispatcher().dispatch(
                ExecutionContext::Background,
                Box::new(move || job_ctx.run_branch(index, branch)),
            );
        }
    }
}

/// Latch state shared by the branches of one merge.
struct JoinCtx {
    run: Arc<Run>,
    results: Mutex<Vec<Option<Payload>>>,
    remaining: AtomicUsize,
    failed: AtomicBool,
    group: CancellationToken,
}

impl JoinCtx {
    fn run_branch(&self, index: usize, branch: BranchFn) {
        if self.group.is_cancelled() || self.run.is_cancelled() {
            debug!(branch = index, "Merge branch skipped");
            self.count_down();
            return;
        }

        let result = match catch_unwind(AssertUnwindSafe(branch)) {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "merge branch panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match result {
            Ok(value) => {
                self.results.lock()[index] = Some(value);
            }
            Err(cause) => {
                if !self.failed.swap(true, Ordering::SeqCst) {
                    debug!(branch = index, "Merge branch failed; cancelling siblings");
                    self.group.cancel(format!("merge branch {index} failed"));
                    self.run
                        .deliver_error(TasklineError::merge(index, TasklineError::stage(0, cause)));
                }
            }
        }

        self.count_down();
    }

    fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        if self.run.is_cancelled() {
            self.run.abandon();
            return;
        }

        let results: Option<Vec<Payload>> = std::mem::take(&mut *self.results.lock())
            .into_iter()
            .collect();
        match results {
            Some(values) => self.run.advance(0, Box::new(values)),
            None => self
                .run
                .deliver_error(TasklineError::internal("merge finished with a missing result")),
        }
    }
}

/// Wraps a one-shot combiner as a stage over the collected branch results.
fn combine_stage<R, F>(f: F) -> Stage
where
    R: Send + 'static,
    F: FnOnce(Vec<Payload>) -> anyhow::Result<R> + Send + 'static,
{
    let cell = Mutex::new(Some(f));
    Stage::new(
        ExecutionContext::Background,
        StageKind::Combine,
        Arc::new(move |payload| {
            let values = match downcast::<Vec<Payload>>(payload) {
                Ok(values) => values,
                Err(step) => return step,
            };
            let Some(f) = cell.lock().take() else {
                return Step::Fault(anyhow::anyhow!("combiner already ran"));
            };
            match f(values) {
                Ok(value) => Step::Continue(Box::new(value)),
                Err(e) => Step::Fault(e),
            }
        }),
    )
}

fn take<A: 'static>(values: &mut std::vec::IntoIter<Payload>) -> anyhow::Result<A> {
    let payload = values
        .next()
        .ok_or_else(|| anyhow::anyhow!("merge result missing"))?;
    payload
        .downcast::<A>()
        .map(|value| *value)
        .map_err(|_| anyhow::anyhow!("merge result is not a {}", std::any::type_name::<A>()))
}

fn merged<R, F>(engine: Engine, branches: Vec<BranchFn>, f: F) -> PipelineBuilder<R>
where
    R: Send + 'static,
    F: FnOnce(Vec<Payload>) -> anyhow::Result<R> + Send + 'static,
{
    PipelineBuilder::with_stage(
        engine,
        combine_stage(f),
        Single {
            join: Some(Join::new(branches)),
        },
    )
}

macro_rules! typed_merge {
    ($(#[$doc:meta])* $name:ident { $($field:ident: $ty:ident),+ }) => {
        $(#[$doc])*
        #[must_use = "call merge() to build the pipeline"]
        pub struct $name<$($ty),+> {
            engine: Engine,
            branches: Vec<BranchFn>,
            _types: std::marker::PhantomData<fn() -> ($($ty,)+)>,
        }

        impl<$($ty: Send + 'static),+> $name<$($ty),+> {
            pub(crate) fn new(engine: Engine, branches: Vec<BranchFn>) -> Self {
                Self {
                    engine,
                    branches,
                    _types: std::marker::PhantomData,
                }
            }

            /// Combines the branch results once all of them succeed.
            pub fn merge<R, F>(self, combiner: F) -> PipelineBuilder<R>
            where
                R: Send + 'static,
                F: FnOnce($($ty),+) -> R + Send + 'static,
            {
                self.try_merge(move |$($field),+| Ok(combiner($($field),+)))
            }

            /// Like [`merge`](Self::merge) with a combiner that may fail.
            pub fn try_merge<R, F>(self, combiner: F) -> PipelineBuilder<R>
            where
                R: Send + 'static,
                F: FnOnce($($ty),+) -> anyhow::Result<R> + Send + 'static,
            {
                merged(self.engine, self.branches, move |values| {
                    let mut values = values.into_iter();
                    $(let $field = take::<$ty>(&mut values)?;)+
                    combiner($($field),+)
                })
            }
        }

        impl<$($ty),+> fmt::Debug for $name<$($ty),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("branches", &self.branches.len())
                    .finish()
            }
        }
    };
}

typed_merge!(
    /// Two branches awaiting a combiner.
    MergeWorks2 { a: A, b: B }
);
typed_merge!(
    /// Three branches awaiting a combiner.
    MergeWorks3 { a: A, b: B, c: C }
);
typed_merge!(
    /// Four branches awaiting a combiner.
    MergeWorks4 { a: A, b: B, c: C, d: D }
);

/// Any number of branches of one type awaiting a combiner.
#[must_use = "call merge() to build the pipeline"]
pub struct MergeAll<A> {
    engine: Engine,
    branches: Vec<BranchFn>,
    _type: std::marker::PhantomData<fn() -> A>,
}

impl<A: Send + 'static> MergeAll<A> {
    pub(crate) fn new(engine: Engine, branches: Vec<BranchFn>) -> Self {
        Self {
            engine,
            branches,
            _type: std::marker::PhantomData,
        }
    }

    /// Returns the number of branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Returns true if there are no branches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Combines the results, in branch order, once all succeed.
    pub fn merge<R, F>(self, combiner: F) -> PipelineBuilder<R>
    where
        R: Send + 'static,
        F: FnOnce(Vec<A>) -> R + Send + 'static,
    {
        self.try_merge(move |values| Ok(combiner(values)))
    }

    /// Like [`merge`](Self::merge) with a combiner that may fail.
    pub fn try_merge<R, F>(self, combiner: F) -> PipelineBuilder<R>
    where
        R: Send + 'static,
        F: FnOnce(Vec<A>) -> anyhow::Result<R> + Send + 'static,
    {
        merged(self.engine, self.branches, move |values| {
            let count = values.len();
            let mut values = values.into_iter();
            let typed = (0..count)
                .map(|_| take::<A>(&mut values))
                .collect::<anyhow::Result<Vec<A>>>()?;
            combiner(typed)
        })
    }
}

impl<A> fmt::Debug for MergeAll<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeAll")
            .field("branches", &self.branches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::CallbackProbe;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_background_threads(4)).unwrap()
    }

    #[test]
    fn test_merge_two_heterogeneous_branches() {
        let engine = engine();
        let probe = CallbackProbe::<String>::new();

        let handle = engine
            .merge_works(|| Ok("Merge "), || Ok(100))
            .merge(|a, b| format!("{a}{b}"))
            .on_success(probe.success_fn())
            .start();

        assert_eq!(handle.get().unwrap(), "Merge 100");
        assert_eq!(probe.values(), vec!["Merge 100".to_string()]);
    }

    #[test]
    fn test_merge_waits_for_slowest_branch() {
        let engine = engine();
        let started = Instant::now();

        let handle = engine
            .merge_works3(
                || {
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(1)
                },
                || {
                    std::thread::sleep(Duration::from_millis(150));
                    Ok(2)
                },
                || Ok(3),
            )
            .merge(|a, b, c| a + b + c)
            .start();

        assert_eq!(handle.get().unwrap(), 6);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[test]
    fn test_failed_branch_skips_combiner() {
        let engine = engine();
        let probe = CallbackProbe::<i32>::new();
        let combined = Arc::new(AtomicBool::new(false));
        let combined_clone = combined.clone();

        let handle = engine
            .merge_works(|| Ok(1), || -> anyhow::Result<i32> { anyhow::bail!("offline") })
            .merge(move |a, b| {
                combined_clone.store(true, Ordering::SeqCst);
                a + b
            })
            .on_success(probe.success_fn())
            .on_error(probe.error_fn())
            .start();

        let err = handle.get().unwrap_err();
        assert!(matches!(err, TasklineError::Merge { branch: 1, .. }));
        assert_eq!(err.root_cause().map(ToString::to_string).as_deref(), Some("offline"));
        assert!(!combined.load(Ordering::SeqCst));
        assert_eq!(probe.success_count(), 0);
        assert_eq!(probe.error_count(), 1);
    }

    #[test]
    fn test_panicking_branch_fails_merge() {
        let engine = engine();

        let handle = engine
            .merge_works(|| -> anyhow::Result<i32> { panic!("branch died") }, || Ok(2))
            .merge(|a, b| a + b)
            .start();

        let err = handle.get().unwrap_err();
        assert!(matches!(err, TasklineError::Merge { branch: 0, .. }));
    }

    #[test]
    fn test_merge_all_preserves_branch_order() {
        let engine = engine();
        let branches: Vec<_> = (0..6u64)
            .map(|i| {
                move || -> anyhow::Result<u64> {
                    std::thread::sleep(Duration::from_millis(60 - i * 10));
                    Ok(i)
                }
            })
            .collect();

        let merge = engine.merge_all(branches);
        assert_eq!(merge.len(), 6);
        let handle = merge.merge(|values| values).start();

        assert_eq!(handle.get().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_merge_all_empty_runs_combiner() {
        let engine = engine();
        let handle = engine
            .merge_all(Vec::<fn() -> anyhow::Result<i32>>::new())
            .merge(|values| values.len())
            .start();

        assert_eq!(handle.get().unwrap(), 0);
    }

    #[test]
    fn test_merge_four_then_transform() {
        let engine = engine();
        let handle = engine
            .merge_works4(|| Ok(1u8), || Ok("two"), || Ok(3.0f64), || Ok(vec![4]))
            .merge(|a, b, c, d| format!("{a}-{b}-{c}-{}", d.len()))
            .transform(|s| s.len())
            .start();

        assert_eq!(handle.get().unwrap(), "1-two-3-1".len());
    }

    #[test]
    fn test_cancel_before_branches_finish() {
        let engine = engine();
        let probe = CallbackProbe::<i32>::new();

        let handle = engine
            .merge_works(
                || {
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(1)
                },
                || Ok(2),
            )
            .merge(|a, b| a + b)
            .on_success(probe.success_fn())
            .start();

        assert!(handle.cancel());
        assert!(handle.get().unwrap_err().is_cancelled());
        std::thread::sleep(Duration::from_millis(200));
        engine.flush_foreground(Duration::from_secs(2)).unwrap();
        assert_eq!(probe.success_count(), 0);
    }
}
