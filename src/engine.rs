//! The background presentation engine.
//!
//! One worker thread per swapchain drives completion bookkeeping: while
//! any image has unconfirmed presents it polls for their retirement, and
//! when nothing is outstanding it sleeps on the lifecycle condvar until a
//! present or shutdown wakes it. Present *submission* never happens here;
//! that stays on the calling thread.
//!
//! The engine is a scoped worker: spawned when the swapchain initializes
//! and signalled + joined in `Drop`, so the thread cannot outlive the
//! state it reads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::lifecycle::FrameLifecycle;

/// Interval between retirement polls while work is outstanding.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Checks whether an image's outstanding completions have retired.
///
/// The swapchain implements this with a zero-timeout wait on the image's
/// completion fence; tests substitute their own.
pub trait CompletionPoller: Send {
    fn poll_retired(&self, image_index: usize) -> bool;
}

/// Handle to the background thread. Dropping it stops and joins the
/// thread before returning.
pub struct PresentEngine {
    lifecycle: Arc<FrameLifecycle>,
    thread: Option<JoinHandle<()>>,
}

impl PresentEngine {
    pub fn spawn(
        lifecycle: Arc<FrameLifecycle>,
        poller: Box<dyn CompletionPoller>,
    ) -> std::io::Result<Self> {
        let worker_lifecycle = Arc::clone(&lifecycle);
        let thread = thread::Builder::new()
            .name("wsi-present".into())
            .spawn(move || run(worker_lifecycle, poller))?;
        Ok(Self {
            lifecycle,
            thread: Some(thread),
        })
    }
}

impl Drop for PresentEngine {
    fn drop(&mut self) {
        self.lifecycle.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("presentation engine thread panicked during shutdown");
            }
        }
    }
}

fn run(lifecycle: Arc<FrameLifecycle>, poller: Box<dyn CompletionPoller>) {
    debug!("presentation engine started");

    while let Some(busy) = lifecycle.wait_for_work() {
        // Poll outside the status lock; retirement re-takes it per image.
        for index in busy {
            if poller.poll_retired(index) {
                lifecycle.retire_completions(index);
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    // Covers both the shutdown request and the error path, and releases
    // anything still blocked in acquire or backpressure.
    lifecycle.mark_stopped();
    debug!("presentation engine stopped");
}
