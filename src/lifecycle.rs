//! Image pool lifecycle state machine.
//!
//! This is the GPU-free heart of the swapchain: slot statuses, acquire
//! blocking, per-image pending-completion bookkeeping, the bridge
//! release-lag queue and the sticky error state all live here, behind a
//! single status mutex paired with one condition variable. The condvar
//! carries both "a free image appeared" and "shutdown requested"
//! notifications, so every waiter re-checks its predicate after waking.
//!
//! Image *resources* (driver handles, memory, fences) are deliberately not
//! stored here; they sit behind a separate structural lock in the
//! swapchain. The structural lock is never taken while the status lock is
//! held, which keeps image teardown and the background polling loop free
//! of lock-ordering hazards.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{AcquireResult, WsiError};

/// Bound on per-image presents that have been submitted but not yet
/// confirmed complete. A present against a full queue blocks until the
/// background thread retires something or the engine stops.
pub const MAX_PENDING_COMPLETIONS: usize = 16;

/// Lifecycle of one image slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    /// Slot not yet backed by a real image.
    Invalid,
    /// Eligible for acquisition.
    Free,
    /// Handed to the application; a present is expected.
    Acquired,
}

/// One submitted present awaiting completion confirmation.
#[derive(Debug, Clone, Copy)]
pub struct PendingCompletion {
    /// Monotonic submission serial.
    pub serial: u64,
    /// Application-supplied ordering token, 0 when absent.
    pub present_id: u64,
}

/// How long an acquire may block.
#[derive(Debug, Clone, Copy)]
pub enum AcquireTimeout {
    /// Poll: report [`AcquireResult::NotReady`] instead of waiting.
    Poll,
    /// Wait up to a deadline.
    Deadline(Duration),
    /// Wait until an image frees up or the engine stops.
    Infinite,
}

impl AcquireTimeout {
    /// Map the wire-level convention: 0 polls, `u64::MAX` waits forever,
    /// anything else is a deadline in nanoseconds.
    pub fn from_ns(timeout_ns: u64) -> Self {
        match timeout_ns {
            0 => AcquireTimeout::Poll,
            u64::MAX => AcquireTimeout::Infinite,
            ns => AcquireTimeout::Deadline(Duration::from_nanos(ns)),
        }
    }
}

#[derive(Debug)]
struct Slot {
    status: ImageStatus,
    pending: VecDeque<PendingCompletion>,
}

#[derive(Debug)]
struct State {
    slots: Vec<Slot>,
    /// Bridge-path images submitted but intentionally held back from reuse.
    deferred_release: VecDeque<usize>,
    send_serial: u64,
    last_completed_present_id: u64,
    running: bool,
    error: Option<WsiError>,
}

impl State {
    fn free_image(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.status == ImageStatus::Free)
    }

    fn release(&mut self, index: usize) {
        if self.slots[index].status == ImageStatus::Acquired {
            self.slots[index].status = ImageStatus::Free;
        }
    }
}

/// Shared lifecycle state for one swapchain.
pub struct FrameLifecycle {
    state: Mutex<State>,
    cond: Condvar,
}

impl FrameLifecycle {
    /// A pool of `image_count` slots, all initially [`ImageStatus::Invalid`].
    pub fn new(image_count: usize) -> Self {
        let slots = (0..image_count)
            .map(|_| Slot {
                status: ImageStatus::Invalid,
                pending: VecDeque::new(),
            })
            .collect();
        Self {
            state: Mutex::new(State {
                slots,
                deferred_release: VecDeque::new(),
                send_serial: 0,
                last_completed_present_id: 0,
                running: true,
                error: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().expect("status lock poisoned").slots.len()
    }

    pub fn status(&self, index: usize) -> ImageStatus {
        self.state.lock().expect("status lock poisoned").slots[index].status
    }

    /// Slot becomes acquirable; called once its backing image exists.
    pub fn mark_free(&self, index: usize) {
        let mut state = self.state.lock().expect("status lock poisoned");
        state.slots[index].status = ImageStatus::Free;
        self.cond.notify_all();
    }

    /// Slot is being torn down.
    pub fn invalidate(&self, index: usize) {
        let mut state = self.state.lock().expect("status lock poisoned");
        state.slots[index].status = ImageStatus::Invalid;
    }

    /// Acquire a free image, transitioning it `Free -> Acquired`.
    pub fn acquire(&self, timeout: AcquireTimeout) -> Result<AcquireResult, WsiError> {
        let mut state = self.state.lock().expect("status lock poisoned");

        if let Some(err) = &state.error {
            return Err(err.clone());
        }

        match timeout {
            AcquireTimeout::Poll => match state.free_image() {
                Some(index) => {
                    state.slots[index].status = ImageStatus::Acquired;
                    Ok(AcquireResult::Acquired(index as u32))
                }
                None => Ok(AcquireResult::NotReady),
            },
            AcquireTimeout::Infinite => loop {
                if let Some(index) = state.free_image() {
                    state.slots[index].status = ImageStatus::Acquired;
                    return Ok(AcquireResult::Acquired(index as u32));
                }
                if !state.running {
                    return Err(WsiError::OutOfDate);
                }
                state = self.cond.wait(state).expect("status lock poisoned");
            },
            AcquireTimeout::Deadline(duration) => {
                let deadline = Instant::now() + duration;
                loop {
                    if let Some(index) = state.free_image() {
                        state.slots[index].status = ImageStatus::Acquired;
                        return Ok(AcquireResult::Acquired(index as u32));
                    }
                    if !state.running {
                        return Err(WsiError::OutOfDate);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(AcquireResult::Timeout);
                    }
                    let (guard, _) = self.cond.wait_timeout(state, deadline - now).expect("status lock poisoned");
                    state = guard;
                }
            }
        }
    }

    /// Register a present submission for `index`.
    ///
    /// Applies backpressure while the slot's pending-completion queue is
    /// full; returns `None` when the engine stopped while waiting, in
    /// which case the caller owns releasing the image. On success returns
    /// the submission serial.
    pub fn begin_present(&self, index: usize, present_id: u64) -> Option<u64> {
        let mut state = self.state.lock().expect("status lock poisoned");

        while state.slots[index].pending.len() == MAX_PENDING_COMPLETIONS {
            if !state.running {
                state.last_completed_present_id =
                    state.last_completed_present_id.max(present_id);
                state.release(index);
                self.cond.notify_all();
                return None;
            }
            state = self.cond.wait(state).expect("status lock poisoned");
        }

        state.send_serial += 1;
        let serial = state.send_serial;
        state.slots[index]
            .pending
            .push_back(PendingCompletion { serial, present_id });
        trace!(image = index, serial, "present registered");
        Some(serial)
    }

    /// Bridge-path success: defer the release of `index` behind `lag`
    /// frames, releasing whatever the lag pushes out.
    pub fn defer_release(&self, index: usize, lag: usize) {
        let mut state = self.state.lock().expect("status lock poisoned");
        state.deferred_release.push_back(index);
        while state.deferred_release.len() > lag {
            match state.deferred_release.pop_front() {
                Some(completed) => state.release(completed),
                None => break,
            }
        }
        self.cond.notify_all();
    }

    /// Immediate release of `index` (shared-memory path, or any failure).
    pub fn release_now(&self, index: usize) {
        let mut state = self.state.lock().expect("status lock poisoned");
        state.release(index);
        self.cond.notify_all();
    }

    /// Release everything the lag was holding back. Used on present
    /// failure and at teardown; the queue is drained all at once.
    pub fn drain_deferred(&self) {
        let mut state = self.state.lock().expect("status lock poisoned");
        while let Some(index) = state.deferred_release.pop_front() {
            state.release(index);
        }
        self.cond.notify_all();
    }

    /// Number of images currently held back by the release lag.
    pub fn deferred_len(&self) -> usize {
        self.state.lock().expect("status lock poisoned").deferred_release.len()
    }

    /// Indices that have unconfirmed completions, for the polling thread.
    /// Blocks until there is work, the engine is asked to stop, or an
    /// error is recorded; `None` means "stop polling".
    pub fn wait_for_work(&self) -> Option<Vec<usize>> {
        let mut state = self.state.lock().expect("status lock poisoned");
        loop {
            if !state.running || state.error.is_some() {
                return None;
            }
            let busy: Vec<usize> = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.pending.is_empty())
                .map(|(i, _)| i)
                .collect();
            if !busy.is_empty() {
                return Some(busy);
            }
            state = self.cond.wait(state).expect("status lock poisoned");
        }
    }

    /// Retire every pending completion of `index`; called by the polling
    /// thread once the image's completion fence has signalled.
    pub fn retire_completions(&self, index: usize) -> usize {
        let mut state = self.state.lock().expect("status lock poisoned");
        let mut retired = 0;
        while let Some(done) = state.slots[index].pending.pop_front() {
            state.last_completed_present_id =
                state.last_completed_present_id.max(done.present_id);
            retired += 1;
        }
        if retired > 0 {
            trace!(image = index, retired, "completions retired");
            self.cond.notify_all();
        }
        retired
    }

    pub fn pending_count(&self, index: usize) -> usize {
        self.state.lock().expect("status lock poisoned").slots[index].pending.len()
    }

    /// Highest `present_id` whose completion has been confirmed.
    pub fn last_completed_present_id(&self) -> u64 {
        self.state.lock().expect("status lock poisoned").last_completed_present_id
    }

    /// Record a fatal error; every subsequent operation observes it.
    pub fn set_error(&self, error: WsiError) {
        let mut state = self.state.lock().expect("status lock poisoned");
        if state.error.is_none() {
            state.error = Some(error);
        }
        self.cond.notify_all();
    }

    pub fn error(&self) -> Option<WsiError> {
        self.state.lock().expect("status lock poisoned").error.clone()
    }

    /// Ask every waiter to wind down.
    pub fn request_stop(&self) {
        let mut state = self.state.lock().expect("status lock poisoned");
        state.running = false;
        self.cond.notify_all();
    }

    /// Marks the engine as no longer making progress (set by the polling
    /// thread on exit) and wakes anything still blocked.
    pub fn mark_stopped(&self) {
        self.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("status lock poisoned").running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> FrameLifecycle {
        let lifecycle = FrameLifecycle::new(n);
        for i in 0..n {
            lifecycle.mark_free(i);
        }
        lifecycle
    }

    #[test]
    fn acquire_exhausts_the_pool() {
        let lifecycle = pool(3);
        for expected in 0..3 {
            match lifecycle.acquire(AcquireTimeout::Poll).unwrap() {
                AcquireResult::Acquired(index) => assert_eq!(index, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            lifecycle.acquire(AcquireTimeout::Poll).unwrap(),
            AcquireResult::NotReady
        );
    }

    #[test]
    fn deadline_acquire_times_out() {
        let lifecycle = pool(1);
        let _ = lifecycle.acquire(AcquireTimeout::Poll).unwrap();
        let start = Instant::now();
        let result = lifecycle
            .acquire(AcquireTimeout::Deadline(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(result, AcquireResult::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn release_wakes_deadline_acquire() {
        use std::sync::Arc;
        let lifecycle = Arc::new(pool(1));
        let _ = lifecycle.acquire(AcquireTimeout::Poll).unwrap();

        let waker = Arc::clone(&lifecycle);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.release_now(0);
        });

        let result = lifecycle
            .acquire(AcquireTimeout::Deadline(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(result, AcquireResult::Acquired(0));
        handle.join().unwrap();
    }

    #[test]
    fn stop_unblocks_infinite_acquire() {
        use std::sync::Arc;
        let lifecycle = Arc::new(pool(1));
        let _ = lifecycle.acquire(AcquireTimeout::Poll).unwrap();

        let stopper = Arc::clone(&lifecycle);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stopper.request_stop();
        });

        let err = lifecycle.acquire(AcquireTimeout::Infinite).unwrap_err();
        assert!(matches!(err, WsiError::OutOfDate));
        handle.join().unwrap();
    }

    #[test]
    fn release_lag_holds_back_n_minus_one() {
        let lifecycle = pool(3);
        let lag = 2;

        let a = match lifecycle.acquire(AcquireTimeout::Poll).unwrap() {
            AcquireResult::Acquired(i) => i as usize,
            other => panic!("unexpected {:?}", other),
        };
        let b = match lifecycle.acquire(AcquireTimeout::Poll).unwrap() {
            AcquireResult::Acquired(i) => i as usize,
            other => panic!("unexpected {:?}", other),
        };

        lifecycle.defer_release(a, lag);
        assert_eq!(lifecycle.status(a), ImageStatus::Acquired);

        lifecycle.defer_release(b, lag);
        assert_eq!(lifecycle.status(a), ImageStatus::Acquired);
        assert_eq!(lifecycle.status(b), ImageStatus::Acquired);
        assert_eq!(lifecycle.deferred_len(), 2);

        // Third present pushes the oldest out.
        let c = match lifecycle.acquire(AcquireTimeout::Poll).unwrap() {
            AcquireResult::Acquired(i) => i as usize,
            other => panic!("unexpected {:?}", other),
        };
        lifecycle.defer_release(c, lag);
        assert_eq!(lifecycle.status(a), ImageStatus::Free);
        assert_eq!(lifecycle.deferred_len(), lag);
    }

    #[test]
    fn drain_releases_everything_at_once() {
        let lifecycle = pool(3);
        for _ in 0..2 {
            let index = match lifecycle.acquire(AcquireTimeout::Poll).unwrap() {
                AcquireResult::Acquired(i) => i as usize,
                other => panic!("unexpected {:?}", other),
            };
            lifecycle.defer_release(index, 2);
        }
        assert_eq!(lifecycle.deferred_len(), 2);
        lifecycle.drain_deferred();
        assert_eq!(lifecycle.deferred_len(), 0);
        assert_eq!(lifecycle.status(0), ImageStatus::Free);
        assert_eq!(lifecycle.status(1), ImageStatus::Free);
    }

    #[test]
    fn serials_are_monotonic_and_completions_retire() {
        let lifecycle = pool(2);
        let s1 = lifecycle.begin_present(0, 11).unwrap();
        let s2 = lifecycle.begin_present(1, 12).unwrap();
        assert!(s2 > s1);
        assert_eq!(lifecycle.pending_count(0), 1);

        assert_eq!(lifecycle.retire_completions(0), 1);
        assert_eq!(lifecycle.pending_count(0), 0);
        assert_eq!(lifecycle.last_completed_present_id(), 11);

        lifecycle.retire_completions(1);
        assert_eq!(lifecycle.last_completed_present_id(), 12);
    }

    #[test]
    fn error_is_sticky_and_observed_by_acquire() {
        let lifecycle = pool(2);
        lifecycle.set_error(WsiError::OutOfDate);
        let err = lifecycle.acquire(AcquireTimeout::Poll).unwrap_err();
        assert!(matches!(err, WsiError::OutOfDate));
    }

    #[test]
    fn backpressure_gives_up_when_stopped() {
        use std::sync::Arc;
        let lifecycle = Arc::new(pool(1));
        for _ in 0..MAX_PENDING_COMPLETIONS {
            lifecycle.begin_present(0, 0).unwrap();
        }

        let stopper = Arc::clone(&lifecycle);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stopper.request_stop();
        });

        assert!(lifecycle.begin_present(0, 0).is_none());
        handle.join().unwrap();
    }
}
