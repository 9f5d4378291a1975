//! Canonical resumable operations.
//!
//! Hosts compose most work out of these two adapters: [`poll_fn`] turns a
//! manually state-split closure into a registrable operation, and [`Frames`]
//! is the frame-delay primitive a frame-driven scheduler is built around.

use std::sync::Arc;

use crate::runner::{Advance, Resumable};
use crate::source::{Fault, SimpleSource};

/// Resumable operation built from a closure polled once per tick.
pub struct PollFn<F> {
    f: F,
}

/// Wrap a closure as a resumable operation.
///
/// The closure carries its own suspended state and is called once per tick
/// until it returns `Finished` or an error.
pub fn poll_fn<F>(f: F) -> PollFn<F>
where
    F: FnMut() -> Result<Advance, Fault> + Send,
{
    PollFn { f }
}

impl<F> Resumable for PollFn<F>
where
    F: FnMut() -> Result<Advance, Fault> + Send,
{
    fn advance(&mut self) -> Result<Advance, Fault> {
        (self.f)()
    }
}

/// Finishes after a fixed number of ticks, optionally signaling a
/// [`SimpleSource`] on completion.
pub struct Frames {
    remaining: usize,
    signal: Option<Arc<SimpleSource>>,
}

impl Frames {
    /// Finish after `frames` ticks (zero finishes on the first advance).
    pub fn new(frames: usize) -> Self {
        Self {
            remaining: frames,
            signal: None,
        }
    }

    /// Finish after `frames` ticks and signal `source` when done.
    pub fn with_signal(frames: usize, source: Arc<SimpleSource>) -> Self {
        Self {
            remaining: frames,
            signal: Some(source),
        }
    }
}

impl Resumable for Frames {
    fn advance(&mut self) -> Result<Advance, Fault> {
        if self.remaining > 0 {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return Ok(Advance::Running);
        }
        if let Some(signal) = self.signal.take() {
            // Losing the completion race (an external cancellation) is fine.
            signal.try_signal();
        }
        Ok(Advance::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Runner;
    use crate::source::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_poll_fn_runs_until_finished() {
        let runner = Runner::new("update");
        let polls = Arc::new(AtomicUsize::new(0));

        let counter = polls.clone();
        runner.register(Box::new(poll_fn(move || {
            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if seen == 3 {
                Ok(Advance::Finished)
            } else {
                Ok(Advance::Running)
            }
        })));

        runner.tick();
        runner.tick();
        assert_eq!(runner.len(), 1);
        runner.tick();
        assert!(runner.is_empty());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_frames_signals_after_delay() {
        let runner = Runner::new("update");
        let source = Arc::new(SimpleSource::new());
        let token = source.token();

        runner.register(Box::new(Frames::with_signal(3, source.clone())));

        runner.tick();
        runner.tick();
        assert_eq!(source.status(token).unwrap(), Status::Pending);

        runner.tick();
        assert_eq!(source.status(token).unwrap(), Status::Succeeded);
        assert!(runner.is_empty());
        source.consume(token).unwrap();
    }

    #[test]
    fn test_frames_zero_finishes_immediately() {
        let mut frames = Frames::new(0);
        assert_eq!(frames.advance().unwrap(), Advance::Finished);
    }
}
