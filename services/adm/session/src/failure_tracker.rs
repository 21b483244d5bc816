//! Malformed frame tracker for detecting a desynchronized stream

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Counts malformed frames on one connection.
///
/// Single bad frames are discarded. A run of `threshold` failures inside
/// `window` means the stream is out of sync and the connection must go.
#[derive(Debug)]
pub struct FrameFailureTracker {
    /// Failures tolerated before tearing down
    threshold: u32,
    /// Time window for failure counting
    window: Duration,
    /// Failures in the current run
    count: u32,
    /// Timestamp of first failure in current run
    first_failure: Option<Instant>,
}

impl FrameFailureTracker {
    /// Create a new tracker
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            count: 0,
            first_failure: None,
        }
    }

    /// Record a malformed frame; returns the run length and whether the
    /// threshold was reached
    pub fn record_failure(&mut self, now: Instant) -> (u32, bool) {
        match self.first_failure {
            Some(first) if now.duration_since(first) <= self.window => {
                self.count += 1;
            }
            _ => {
                // Start a new window
                self.count = 1;
                self.first_failure = Some(now);
            }
        }

        let exceeded = self.count >= self.threshold;
        if exceeded {
            warn!("{} malformed frames within {:?}", self.count, self.window);
        } else {
            debug!("Recorded malformed frame (count: {})", self.count);
        }
        (self.count, exceeded)
    }

    /// A well-formed frame ends the run
    pub fn record_success(&mut self) {
        self.count = 0;
        self.first_failure = None;
    }

    /// Failures in the current run
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_threshold() {
        let mut tracker = FrameFailureTracker::new(3, Duration::from_secs(30));
        let now = Instant::now();
        assert_eq!(tracker.record_failure(now), (1, false));
        assert_eq!(tracker.record_failure(now), (2, false));
        assert_eq!(tracker.record_failure(now), (3, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_run() {
        let mut tracker = FrameFailureTracker::new(3, Duration::from_secs(30));
        let now = Instant::now();
        tracker.record_failure(now);
        tracker.record_failure(now);
        tracker.record_success();
        assert_eq!(tracker.count(), 0);
        assert_eq!(tracker.record_failure(now), (1, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry() {
        let mut tracker = FrameFailureTracker::new(2, Duration::from_secs(10));
        let now = Instant::now();
        tracker.record_failure(now);
        assert_eq!(
            tracker.record_failure(now + Duration::from_secs(11)),
            (1, false)
        );
    }
}
