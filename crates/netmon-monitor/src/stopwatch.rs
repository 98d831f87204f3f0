//! Evaluation duration timer.

use std::time::{Duration, Instant};

/// Measures time from the first evaluation attempt to a verdict.
///
/// Re-entering evaluation does not restart a running stopwatch.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Stopwatch {
    started: Option<Instant>,
}

impl Stopwatch {
    /// Starts timing unless already running.
    pub(crate) fn start_if_idle(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Stops and resets, returning the elapsed time if it was running.
    pub(crate) fn stop(&mut self) -> Option<Duration> {
        self.started.take().map(|started| started.elapsed())
    }

    /// Discards any running measurement.
    pub(crate) fn reset(&mut self) {
        self.started = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.started.is_some()
    }
}
