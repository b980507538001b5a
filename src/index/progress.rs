//! Time-window coalescing for progress callbacks.
//!
//! Index builds emit progress per item; subscribers want a bounded event
//! rate. The emitter keeps only the latest pending report and flushes it
//! at most once per interval, plus a final flush on completion.

use std::time::{Duration, Instant};

use super::IndexProgress;

pub type ProgressSink = Box<dyn FnMut(IndexProgress) + Send>;

pub struct ThrottledProgress {
    sink: ProgressSink,
    min_interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<IndexProgress>,
}

impl ThrottledProgress {
    const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(sink: ProgressSink) -> Self {
        Self::with_interval(sink, Self::DEFAULT_INTERVAL)
    }

    pub fn with_interval(sink: ProgressSink, min_interval: Duration) -> Self {
        ThrottledProgress {
            sink,
            min_interval,
            last_emit: None,
            pending: None,
        }
    }

    /// A sink that drops every report.
    pub fn discard() -> Self {
        Self::new(Box::new(|_| {}))
    }

    /// Record the latest progress; emits only when the window has elapsed.
    pub fn report(&mut self, progress: IndexProgress) {
        self.pending = Some(progress);
        let due = match self.last_emit {
            None => true,
            Some(at) => at.elapsed() >= self.min_interval,
        };
        if due {
            self.flush();
        }
    }

    /// Emit the pending report, if any, regardless of the window.
    pub fn flush(&mut self) {
        if let Some(progress) = self.pending.take() {
            (self.sink)(progress);
            self.last_emit = Some(Instant::now());
        }
    }
}

impl Drop for ThrottledProgress {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn collecting() -> (Arc<Mutex<Vec<IndexProgress>>>, ProgressSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            Box::new(move |p| seen.lock().unwrap().push(p))
        };
        (seen, sink)
    }

    #[test]
    fn coalesces_rapid_reports() {
        let (seen, sink) = collecting();
        let mut progress =
            ThrottledProgress::with_interval(sink, Duration::from_secs(3600));
        for loaded in 0..100 {
            progress.report(IndexProgress::indexing(100, loaded));
        }
        progress.flush();
        let seen = seen.lock().unwrap();
        // First report emits immediately, the rest coalesce into the final
        // flush.
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].loaded, Some(0));
        assert_eq!(seen[1].loaded, Some(99));
    }

    #[test]
    fn zero_interval_emits_everything() {
        let (seen, sink) = collecting();
        let mut progress = ThrottledProgress::with_interval(sink, Duration::ZERO);
        for loaded in 0..5 {
            progress.report(IndexProgress::indexing(5, loaded));
        }
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn drop_flushes_pending() {
        let (seen, sink) = collecting();
        {
            let mut progress =
                ThrottledProgress::with_interval(sink, Duration::from_secs(3600));
            progress.report(IndexProgress::counting(1));
            progress.report(IndexProgress::counting(2));
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().unwrap().total, 2);
    }
}
