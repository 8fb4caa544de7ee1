//! A foreground that only runs jobs when told to.

use crate::dispatch::{ForegroundDispatcher, Job};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Queues posted jobs until [`run_pending`](Self::run_pending) is called,
/// standing in for a host event loop.
#[derive(Default)]
pub struct ManualForeground {
    queue: Mutex<VecDeque<Job>>,
    posted: Condvar,
}

impl ManualForeground {
    /// Creates an empty foreground.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs queued jobs, including any they post, on the calling thread.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Waits until at least `count` jobs are queued.
    pub fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.len() < count {
            if self.posted.wait_until(&mut queue, deadline).timed_out() {
                return queue.len() >= count;
            }
        }
        true
    }
}

impl ForegroundDispatcher for ManualForeground {
    fn post(&self, job: Job) {
        self.queue.lock().push_back(job);
        self.posted.notify_all();
    }
}

impl std::fmt::Debug for ManualForeground {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualForeground")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_wait_for_run_pending() {
        let foreground = ManualForeground::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            foreground.post(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(foreground.pending_count(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(foreground.run_pending(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(foreground.pending_count(), 0);
    }

    #[test]
    fn test_wait_for_pending() {
        let foreground = Arc::new(ManualForeground::new());
        assert!(!foreground.wait_for_pending(1, Duration::from_millis(10)));

        let poster = foreground.clone();
        let worker = std::thread::spawn(move || poster.post(Box::new(|| {})));

        assert!(foreground.wait_for_pending(1, Duration::from_secs(2)));
        worker.join().unwrap();
    }
}
