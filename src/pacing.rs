//! Wall-clock pacing of bridge frame submission.
//!
//! The bridge path needs a submission cap independent of the application's
//! present mode: without one, MAILBOX/IMMEDIATE-style submission can recycle
//! dma-bufs faster than the compositor retires them, producing visible
//! reuse artifacts. The cap is layered on top of feedback-based pacing, not
//! a replacement for it.

use std::time::{Duration, Instant};

use tracing::info;

/// Paces presents to a fixed frames-per-second cap.
///
/// The "next allowed present time" always advances by one interval from
/// the timestamp observed *after* any sleep, so sleep overshoot does not
/// accumulate into drift.
#[derive(Debug)]
pub struct FramePacer {
    interval: Option<Duration>,
    next_present: Option<Instant>,
}

impl FramePacer {
    /// A pacer that never throttles.
    pub fn disabled() -> Self {
        Self {
            interval: None,
            next_present: None,
        }
    }

    /// A pacer capping submission at `fps` frames per second. `0` disables
    /// pacing entirely.
    pub fn new(fps: u32) -> Self {
        if fps == 0 {
            return Self::disabled();
        }
        Self {
            interval: Some(Duration::from_nanos(1_000_000_000 / u64::from(fps))),
            next_present: None,
        }
    }

    /// Like [`new`](Self::new), announcing the decision once.
    pub fn for_bridge(fps: u32, has_override: bool) -> Self {
        if fps == 0 {
            if has_override {
                info!("bridge present pacing disabled by configuration");
            }
            return Self::disabled();
        }
        info!("bridge present pacing enabled at {} FPS", fps);
        Self::new(fps)
    }

    /// Whether this pacer throttles at all.
    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// The configured interval, if pacing is enabled.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Block until the next present is allowed, then schedule the one after.
    ///
    /// The first call after construction never sleeps; it only arms the
    /// schedule.
    pub fn throttle(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        let Some(next) = self.next_present else {
            self.next_present = Some(Instant::now() + interval);
            return;
        };

        let now = Instant::now();
        if now < next {
            std::thread::sleep(next - now);
        }

        let after_wait = Instant::now();
        self.next_present = Some(after_wait + interval);
    }
}
