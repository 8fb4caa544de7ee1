//! Lifecycle registry for bulk cancellation of started work.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Hook invoked once when a piece of work reaches a terminal state.
pub type FinishHook = Box<dyn FnOnce() + Send>;

/// Started work that a [`LifecycleRegistry`] can track and cancel.
pub trait ManagedWork: Send + Sync {
    /// Requests cancellation of the work.
    fn cancel(&self) -> bool;

    /// Returns true until the work finishes or observes cancellation.
    fn is_active(&self) -> bool;

    /// Registers a hook to run when the work reaches a terminal state.
    ///
    /// If the work has already finished, the hook runs immediately.
    fn on_finished(&self, hook: FinishHook);
}

#[derive(Default)]
struct RegistryInner {
    works: DashMap<u64, Arc<dyn ManagedWork>>,
    next_id: AtomicU64,
}

/// Thread-safe set of started pipeline and channel handles.
///
/// Entries remove themselves when their work finishes. Cloning yields a
/// second handle onto the same registry.
#[derive(Clone, Default)]
pub struct LifecycleRegistry {
    inner: Arc<RegistryInner>,
}

impl LifecycleRegistry {
    /// Creates a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a started handle.
    ///
    /// Work that has already finished is not retained.
    pub fn add_active_work<W>(&self, work: &W)
    where
        W: ManagedWork + Clone + 'static,
    {
        if !work.is_active() {
            return;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.works.insert(id, Arc::new(work.clone()));

        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        work.on_finished(Box::new(move || {
            if let Some(inner) = registry.upgrade() {
                inner.works.remove(&id);
            }
        }));
    }

    /// Cancels every registered work and clears the set.
    pub fn cancel_all_works(&self) {
        let ids: Vec<u64> = self.inner.works.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0usize;

        for id in ids {
            // Removed before cancelling so the finish hook finds nothing to do.
            if let Some((_, work)) = self.inner.works.remove(&id) {
                if work.cancel() {
                    cancelled += 1;
                }
            }
        }

        debug!(cancelled, "Cancelled all registered works");
    }

    /// Returns true if at least one registered work is still live.
    #[must_use]
    pub fn has_active_works(&self) -> bool {
        !self.inner.works.is_empty()
    }

    /// Returns the number of registered works.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.works.len()
    }
}

impl std::fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleRegistry")
            .field("active_count", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    #[derive(Clone, Default)]
    struct FakeWork {
        state: Arc<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        cancelled: AtomicBool,
        finished: AtomicBool,
        hooks: Mutex<Vec<FinishHook>>,
    }

    impl FakeWork {
        fn finish(&self) {
            self.state.finished.store(true, Ordering::SeqCst);
            let hooks = std::mem::take(&mut *self.state.hooks.lock());
            for hook in hooks {
                hook();
            }
        }
    }

    impl ManagedWork for FakeWork {
        fn cancel(&self) -> bool {
            let first = !self.state.cancelled.swap(true, Ordering::SeqCst);
            self.finish();
            first
        }

        fn is_active(&self) -> bool {
            !self.state.cancelled.load(Ordering::SeqCst)
                && !self.state.finished.load(Ordering::SeqCst)
        }

        fn on_finished(&self, hook: FinishHook) {
            if self.state.finished.load(Ordering::SeqCst) {
                hook();
            } else {
                self.state.hooks.lock().push(hook);
            }
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = LifecycleRegistry::new();
        assert!(!registry.has_active_works());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_add_and_auto_remove() {
        let registry = LifecycleRegistry::new();
        let work = FakeWork::default();

        registry.add_active_work(&work);
        assert!(registry.has_active_works());

        work.finish();
        assert!(!registry.has_active_works());
    }

    #[test]
    fn test_finished_work_not_retained() {
        let registry = LifecycleRegistry::new();
        let work = FakeWork::default();
        work.finish();

        registry.add_active_work(&work);
        assert!(!registry.has_active_works());
    }

    #[test]
    fn test_cancel_all_works() {
        let registry = LifecycleRegistry::new();
        let works: Vec<FakeWork> = (0..3).map(|_| FakeWork::default()).collect();
        for work in &works {
            registry.add_active_work(work);
        }
        assert_eq!(registry.active_count(), 3);

        registry.cancel_all_works();

        assert!(!registry.has_active_works());
        assert!(works.iter().all(|w| !w.is_active()));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = LifecycleRegistry::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let work = FakeWork::default();
                        registry.add_active_work(&work);
                        work.finish();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert!(!registry.has_active_works());
    }
}
