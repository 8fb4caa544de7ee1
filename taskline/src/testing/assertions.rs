//! Test assertions for pipelines and channels.

use super::probe::CallbackProbe;
use crate::errors::{Result, TasklineError};
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Polls `condition` until it holds, panicking after `timeout`.
pub fn assert_eventually<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "Condition not met within {timeout:?}"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Asserts that the probe saw exactly one success, equal to `expected`,
/// and no error.
pub fn assert_single_success<T>(probe: &CallbackProbe<T>, expected: &T)
where
    T: Clone + Debug + PartialEq + Send + 'static,
{
    let values = probe.values();
    assert_eq!(
        values.as_slice(),
        std::slice::from_ref(expected),
        "Expected exactly one success"
    );
    assert_eq!(
        probe.error_count(),
        0,
        "Expected no errors, got {:?}",
        probe.errors()
    );
}

/// Asserts that the probe saw no callback at all.
pub fn assert_no_callbacks<T>(probe: &CallbackProbe<T>)
where
    T: Clone + Debug + Send + 'static,
{
    assert!(
        probe.success_count() == 0 && probe.error_count() == 0,
        "Expected no callbacks, got values {:?} and errors {:?}",
        probe.values(),
        probe.errors()
    );
}

/// Asserts that a `get()` result reports cancellation.
pub fn assert_cancelled<T: Debug>(result: &Result<T>) {
    assert!(
        matches!(result, Err(TasklineError::Cancelled)),
        "Expected cancellation, got {result:?}"
    );
}

/// Asserts that a `get()` result failed at `stage`.
pub fn assert_stage_failed<T: Debug>(result: &Result<T>, stage: usize) {
    match result {
        Err(TasklineError::Stage { stage: actual, .. }) => assert_eq!(
            *actual, stage,
            "Expected failure at stage {stage}, got stage {actual}"
        ),
        other => panic!("Expected stage failure, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_eventually_passes() {
        let start = Instant::now();
        assert_eventually(Duration::from_secs(1), || {
            start.elapsed() > Duration::from_millis(10)
        });
    }

    #[test]
    #[should_panic(expected = "Condition not met")]
    fn test_assert_eventually_times_out() {
        assert_eventually(Duration::from_millis(20), || false);
    }

    #[test]
    fn test_single_success() {
        let probe = CallbackProbe::<i32>::new();
        probe.success_fn()(&4);
        assert_single_success(&probe, &4);
    }

    #[test]
    fn test_result_assertions() {
        assert_cancelled::<i32>(&Err(TasklineError::Cancelled));
        assert_stage_failed::<i32>(&Err(TasklineError::stage(2, anyhow::anyhow!("x"))), 2);
        assert_no_callbacks(&CallbackProbe::<i32>::new());
    }
}
