use std::collections::VecDeque;

/// Rolling byte-rate meter. Samples are (timestamp-ms, bytes) pairs kept
/// over a fixed window; the average is bytes per second over the span
/// actually covered.
#[derive(Debug)]
pub struct Rate {
    window_ms: u64,
    samples: VecDeque<(u64, u64)>,
    total: u64,
}

impl Rate {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_ms: window_secs.max(1) * 1000,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Record `bytes` observed at `now_ms`. A zero-byte sample still
    /// advances the window, which is how idle periods drag the average
    /// down.
    pub fn add(&mut self, bytes: u64, now_ms: u64) {
        self.samples.push_back((now_ms, bytes));
        self.total += bytes;
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some(&(ts, b)) = self.samples.front() {
            if ts >= cutoff || self.samples.len() == 1 {
                break;
            }
            self.total -= b;
            self.samples.pop_front();
        }
    }

    /// Average rate in bytes per second over the retained span.
    pub fn avg(&self) -> u64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(&(f, _)), Some(&(l, _))) => (f, l),
            _ => return 0,
        };
        let span_ms = (last - first).max(1000);
        self.total * 1000 / span_ms
    }

    /// Shrink the retained span to at most `keep_ms`, so that a change in
    /// the client population is reflected quickly instead of being
    /// averaged against stale history.
    pub fn reduce(&mut self, keep_ms: u64) {
        let newest = match self.samples.back() {
            Some(&(ts, _)) => ts,
            None => return,
        };
        let cutoff = newest.saturating_sub(keep_ms);
        while let Some(&(ts, b)) = self.samples.front() {
            if ts >= cutoff || self.samples.len() == 1 {
                break;
            }
            self.total -= b;
            self.samples.pop_front();
        }
    }
}
