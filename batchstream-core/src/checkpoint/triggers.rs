use std::time::{Duration, Instant};

use tracing::trace;

use crate::types::WindowIndex;

/// Decides after which windows a checkpoint is written
pub trait CheckpointTrigger: 'static {
    /// Called after every committed window
    fn should_checkpoint(&mut self, window: WindowIndex) -> bool;

    /// Whether uncheckpointed state should be persisted when the driver shuts down
    fn on_shutdown(&self) -> bool {
        true
    }
}
impl<F> CheckpointTrigger for F
where
    F: FnMut(WindowIndex) -> bool + 'static,
{
    fn should_checkpoint(&mut self, window: WindowIndex) -> bool {
        self(window)
    }
}

/// Fires on the first window committed after `interval` of wall clock time has passed.
///
/// The next deadline is taken from the window that fired, so a job which stalled for several
/// intervals checkpoints once rather than on every following window.
pub struct IntervalCheckpoints {
    interval: Duration,
    due: Instant,
}

impl IntervalCheckpoints {
    /// The first checkpoint becomes due `interval` after creating the trigger
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            due: Instant::now() + interval,
        }
    }
}

impl CheckpointTrigger for IntervalCheckpoints {
    fn should_checkpoint(&mut self, window: WindowIndex) -> bool {
        let now = Instant::now();
        if now < self.due {
            return false;
        }
        trace!(window, overdue = ?now.duration_since(self.due), "Checkpoint interval elapsed");
        self.due = now + self.interval;
        true
    }
}

/// Fires after every `n`th committed window
pub struct EveryNWindows {
    n: u64,
    since_last: u64,
}

impl EveryNWindows {
    /// **PANIC:** if `n` is zero
    pub fn new(n: u64) -> Self {
        assert!(n > 0, "checkpoint interval must be at least one window");
        Self { n, since_last: 0 }
    }
}
impl CheckpointTrigger for EveryNWindows {
    fn should_checkpoint(&mut self, _window: WindowIndex) -> bool {
        self.since_last += 1;
        if self.since_last >= self.n {
            self.since_last = 0;
            true
        } else {
            false
        }
    }
}

/// Never write checkpoints, not even on shutdown
pub struct NoCheckpoints;
impl CheckpointTrigger for NoCheckpoints {
    #[inline(always)]
    fn should_checkpoint(&mut self, _window: WindowIndex) -> bool {
        false
    }

    fn on_shutdown(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_n_windows() {
        let mut trigger = EveryNWindows::new(3);
        let fired: Vec<bool> = (0..7).map(|w| trigger.should_checkpoint(w)).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn every_window() {
        let mut trigger = EveryNWindows::new(1);
        assert!((0..5).all(|w| trigger.should_checkpoint(w)));
    }

    #[test]
    fn interval_waits() {
        let mut trigger = IntervalCheckpoints::new(Duration::from_secs(3600));
        assert!(!trigger.should_checkpoint(0));

        let mut trigger = IntervalCheckpoints::new(Duration::from_millis(30));
        assert!(!trigger.should_checkpoint(0));
        std::thread::sleep(Duration::from_millis(40));
        assert!(trigger.should_checkpoint(1));
        // the deadline moved on, the next window is not due yet
        assert!(!trigger.should_checkpoint(2));
    }

    #[test]
    fn zero_interval_fires_every_window() {
        let mut trigger = IntervalCheckpoints::new(Duration::ZERO);
        assert!((0..5).all(|w| trigger.should_checkpoint(w)));
    }

    #[test]
    fn closures_are_triggers() {
        let mut trigger = |w: WindowIndex| w % 2 == 1;
        assert!(!trigger.should_checkpoint(0));
        assert!(CheckpointTrigger::should_checkpoint(&mut trigger, 1));
        assert!(trigger.on_shutdown());
        assert!(!NoCheckpoints.on_shutdown());
    }
}
