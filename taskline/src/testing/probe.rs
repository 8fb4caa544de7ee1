//! Recording callbacks.

use crate::errors::TasklineError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct ProbeState<T> {
    values: Vec<T>,
    errors: Vec<TasklineError>,
    threads: Vec<String>,
}

#[derive(Debug)]
struct ProbeInner<T> {
    state: Mutex<ProbeState<T>>,
    changed: Condvar,
}

/// Records every value and error delivered to the callbacks it hands out,
/// along with the thread each callback ran on.
#[derive(Debug)]
pub struct CallbackProbe<T> {
    inner: Arc<ProbeInner<T>>,
}

impl<T> Clone for CallbackProbe<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for CallbackProbe<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                state: Mutex::new(ProbeState {
                    values: Vec::new(),
                    errors: Vec::new(),
                    threads: Vec::new(),
                }),
                changed: Condvar::new(),
            }),
        }
    }
}

fn current_thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}

impl<T: Clone + Send + 'static> CallbackProbe<T> {
    /// Creates an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a success callback that records into this probe.
    pub fn success_fn(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let inner = self.inner.clone();
        move |value: &T| {
            let mut state = inner.state.lock();
            state.values.push(value.clone());
            state.threads.push(current_thread_name());
            inner.changed.notify_all();
        }
    }

    /// Returns an error callback that records into this probe.
    pub fn error_fn(&self) -> impl Fn(&TasklineError) + Send + Sync + 'static {
        let inner = self.inner.clone();
        move |error: &TasklineError| {
            let mut state = inner.state.lock();
            state.errors.push(error.clone());
            state.threads.push(current_thread_name());
            inner.changed.notify_all();
        }
    }

    /// Returns the recorded values in delivery order.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.inner.state.lock().values.clone()
    }

    /// Returns the recorded errors in delivery order.
    #[must_use]
    pub fn errors(&self) -> Vec<TasklineError> {
        self.inner.state.lock().errors.clone()
    }

    /// Returns the thread name of every recorded callback.
    #[must_use]
    pub fn threads(&self) -> Vec<String> {
        self.inner.state.lock().threads.clone()
    }

    /// Number of success callbacks so far.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.inner.state.lock().values.len()
    }

    /// Number of error callbacks so far.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.inner.state.lock().errors.len()
    }

    /// Waits until at least `count` successes are recorded.
    pub fn wait_for_successes(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.values.len() >= count)
    }

    /// Waits until at least `count` errors are recorded.
    pub fn wait_for_errors(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.errors.len() >= count)
    }

    /// Waits until at least `count` callbacks of either kind are recorded.
    pub fn wait_for_total(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.values.len() + state.errors.len() >= count)
    }

    fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&ProbeState<T>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !done(&state) {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return done(&state);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_records_values_and_errors() {
        let probe = CallbackProbe::<i32>::new();
        let on_success = probe.success_fn();
        let on_error = probe.error_fn();

        on_success(&1);
        on_success(&2);
        on_error(&TasklineError::Cancelled);

        assert_eq!(probe.values(), vec![1, 2]);
        assert_eq!(probe.error_count(), 1);
        assert_eq!(probe.threads().len(), 3);
    }

    #[test]
    fn test_wait_across_threads() {
        let probe = CallbackProbe::<&'static str>::new();
        let on_success = probe.success_fn();

        let worker = std::thread::Builder::new()
            .name("probe-worker".to_string())
            .spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                on_success(&"done");
            })
            .unwrap();

        assert!(probe.wait_for_successes(1, Duration::from_secs(2)));
        worker.join().unwrap();
        assert_eq!(probe.threads(), vec!["probe-worker".to_string()]);
    }

    #[test]
    fn test_wait_times_out() {
        let probe = CallbackProbe::<i32>::new();
        assert!(!probe.wait_for_total(1, Duration::from_millis(20)));
    }
}
