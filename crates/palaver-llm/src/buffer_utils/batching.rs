use tokio::time::{interval, Duration, Interval, MissedTickBehavior};

/// Collects events and releases them at most once per window.
///
/// Meant to sit in a `tokio::select!` next to the event source; windows in
/// which nothing was pushed are skipped.
pub struct EventBatcher<T> {
    batch: Vec<T>,
    ticker: Interval,
}

impl<T> EventBatcher<T> {
    pub fn new(window: Duration) -> Self {
        let mut ticker = interval(window.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            batch: Vec::new(),
            ticker,
        }
    }

    pub fn push(&mut self, event: T) {
        self.batch.push(event);
    }

    /// Waits for the next window boundary with a non-empty batch.
    ///
    /// Cancel-safe: dropping the future loses no events.
    pub async fn next_batch(&mut self) -> Vec<T> {
        loop {
            self.ticker.tick().await;
            if !self.batch.is_empty() {
                return std::mem::take(&mut self.batch);
            }
        }
    }

    /// Release everything now, regardless of the window
    pub fn flush(&mut self) -> Vec<T> {
        std::mem::take(&mut self.batch)
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}
