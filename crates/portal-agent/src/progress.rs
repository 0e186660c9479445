use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Receives short human-readable status lines from long-running operations.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Discards everything.
impl ProgressSink for () {
    fn report(&self, _message: &str) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, message: &str) {
        self(message)
    }
}

impl ProgressSink for mpsc::UnboundedSender<String> {
    fn report(&self, message: &str) {
        // Receiver gone means nobody is watching anymore.
        let _ = self.send(message.to_string());
    }
}

/// Decides when a counter-driven loop should emit progress: every `every`
/// steps, or once `interval` has passed since the last emission.
#[derive(Debug)]
pub(crate) struct Throttle {
    every: u64,
    interval: Duration,
    last_emit_at: Instant,
}

impl Throttle {
    pub(crate) fn new(every: u64, interval: Duration) -> Self {
        Self {
            every: every.max(1),
            interval,
            last_emit_at: Instant::now(),
        }
    }

    pub(crate) fn should_emit(&mut self, processed: u64) -> bool {
        self.should_emit_at(processed, Instant::now())
    }

    fn should_emit_at(&mut self, processed: u64, now: Instant) -> bool {
        let emit = processed % self.every == 0 || now.duration_since(self.last_emit_at) > self.interval;
        if emit {
            self.last_emit_at = now;
        }
        emit
    }
}
