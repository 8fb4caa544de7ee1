//! Background executor abstraction and the default tokio-backed pool.

use crate::errors::{Result, TasklineError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes jobs off the caller's thread.
pub trait Executor: Send + Sync {
    /// Schedules a job to run as soon as a worker is free.
    fn submit(&self, job: Job);

    /// Schedules a job to run once `delay` has elapsed.
    fn submit_after_delay(&self, job: Job, delay: Duration);
}

/// Bounded worker pool for background stages.
///
/// Jobs run on tokio's blocking pool, capped at `threads` workers, so stage
/// functions are free to block. A single async worker drives the timers used
/// for delayed submission.
pub struct BackgroundPool {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    threads: usize,
}

impl BackgroundPool {
    /// Builds a pool with `threads` workers named `<prefix>-background-N`.
    ///
    /// # Errors
    ///
    /// Returns an error if `threads` is zero or the runtime cannot start.
    pub fn new(threads: usize, thread_name_prefix: &str) -> Result<Self> {
        if threads == 0 {
            return Err(TasklineError::InvalidConfig(
                "background pool needs at least one thread".to_string(),
            ));
        }

        let prefix = thread_name_prefix.to_string();
        let counter = Arc::new(AtomicUsize::new(0));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name_fn(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{prefix}-background-{n}")
            })
            .enable_time()
            .build()?;

        debug!(threads, "Background pool started");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            threads,
        })
    }

    /// Returns the maximum number of concurrently running jobs.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Executor for BackgroundPool {
    fn submit(&self, job: Job) {
        // Detached; completion is observed through the pipeline, not the handle.
        drop(self.handle.spawn_blocking(job));
    }

    fn submit_after_delay(&self, job: Job, delay: Duration) {
        let handle = self.handle.clone();
        drop(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            drop(handle.spawn_blocking(job));
        }));
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        // The last engine reference may be released on one of our own
        // workers, where a blocking shutdown would panic.
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for BackgroundPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundPool")
            .field("threads", &self.threads)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_zero_threads_rejected() {
        let result = BackgroundPool::new(0, "test");
        assert!(matches!(result, Err(TasklineError::InvalidConfig(_))));
    }

    #[test]
    fn test_submit_runs_job() {
        let pool = BackgroundPool::new(2, "test").unwrap();
        let (tx, rx) = mpsc::channel();

        pool.submit(Box::new(move || {
            tx.send(std::thread::current().name().map(str::to_string)).unwrap();
        }));

        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(name.unwrap_or_default().starts_with("test-background-"));
    }

    #[test]
    fn test_submit_after_delay_waits() {
        let pool = BackgroundPool::new(1, "test").unwrap();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();

        pool.submit_after_delay(
            Box::new(move || {
                tx.send(()).unwrap();
            }),
            Duration::from_millis(100),
        );

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_pool_bounds_concurrency() {
        let pool = BackgroundPool::new(2, "test").unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }

        for _ in 0..6 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
