//! The serialized foreground lane.

use super::executor::Job;
use crate::errors::{Result, TasklineError};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, warn};

/// Runs posted jobs one at a time, in posting order.
///
/// Hosts with their own event loop (a UI thread, a game loop) implement
/// this to receive terminal callbacks on that loop.
pub trait ForegroundDispatcher: Send + Sync {
    /// Queues a job behind everything already posted.
    fn post(&self, job: Job);
}

/// Default foreground: one dedicated thread draining an unbounded queue.
pub struct ForegroundLane {
    sender: Mutex<Option<UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
}

impl ForegroundLane {
    /// Spawns the lane thread, named `<prefix>-foreground`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(thread_name_prefix: &str) -> Result<Self> {
        let (sender, mut receiver) = unbounded_channel::<Job>();
        let thread_name = format!("{thread_name_prefix}-foreground");

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                        warn!("Foreground job panicked: {:?}", e);
                    }
                }
                debug!("Foreground lane drained");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            thread_name,
        })
    }

    /// Returns the name of the lane thread.
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Blocks until every job posted before this call has run.
    ///
    /// # Errors
    ///
    /// Returns [`TasklineError::Timeout`] if the lane does not drain in time.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        flush(self, timeout)
    }

    /// Stops accepting jobs; the thread exits after draining the queue.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}

impl Drop for ForegroundLane {
    fn drop(&mut self) {
        self.shutdown();
        let Some(thread) = self.thread.get_mut().take() else {
            return;
        };
        // The last engine handle may be released by a job on the lane itself.
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("Foreground lane thread panicked");
        }
    }
}

/// Posts a marker job to `foreground` and waits for it to run.
pub(crate) fn flush(foreground: &dyn ForegroundDispatcher, timeout: Duration) -> Result<()> {
    let (tx, rx) = mpsc::sync_channel(1);
    foreground.post(Box::new(move || {
        let _ = tx.send(());
    }));
    rx.recv_timeout(timeout)
        .map_err(|_| TasklineError::Timeout(timeout))
}

impl ForegroundDispatcher for ForegroundLane {
    fn post(&self, job: Job) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("Foreground lane stopped; job dropped");
                }
            }
            None => warn!("Foreground lane shut down; job dropped"),
        }
    }
}

impl std::fmt::Debug for ForegroundLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForegroundLane")
            .field("thread_name", &self.thread_name)
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}
