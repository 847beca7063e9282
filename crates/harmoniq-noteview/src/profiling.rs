//! Stage timing for the frame pipeline.

use std::time::{Duration, Instant};

/// Times one pipeline stage and reports it through [`tracing`].
#[derive(Debug)]
pub struct StageTimer {
    label: &'static str,
    start: Instant,
    finished: bool,
}

impl StageTimer {
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
            finished: false,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Stops the timer and returns the elapsed time.
    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let duration = self.start.elapsed();
        tracing::trace!(target: "profiling", stage = self.label, elapsed = ?duration);
        duration
    }

    /// Stops the timer and returns the elapsed time in milliseconds.
    pub fn finish_ms(self) -> f64 {
        duration_ms(self.finish())
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        if !self.finished {
            let duration = self.start.elapsed();
            tracing::trace!(
                target: "profiling",
                stage = self.label,
                elapsed = ?duration,
                "stage abandoned"
            );
        }
    }
}

pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
