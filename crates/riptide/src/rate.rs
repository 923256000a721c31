use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Rolling byte-rate counter over a fixed window. Backs choke ranking and
/// pipeline sizing; also keeps the lifetime total for announce parameters.
#[derive(Debug)]
pub struct Rate {
    span: Duration,
    samples: VecDeque<(Instant, u64)>,
    in_window: u64,
    total: u64,
}

impl Rate {
    pub fn new(span: Duration) -> Self {
        Rate {
            span,
            samples: VecDeque::new(),
            in_window: 0,
            total: 0,
        }
    }

    /// The conventional 30 second window.
    pub fn new_transfer_rate() -> Self {
        Rate::new(Duration::from_secs(30))
    }

    pub fn insert(&mut self, bytes: u64) {
        let now = Instant::now();
        self.expire(now);
        self.total += bytes;
        self.in_window += bytes;
        match self.samples.back_mut() {
            Some((at, acc)) if *at == now => *acc += bytes,
            _ => self.samples.push_back((now, bytes)),
        }
    }

    /// Bytes per second over the window.
    pub fn rate(&mut self) -> u64 {
        self.expire(Instant::now());
        self.in_window / self.span.as_secs().max(1)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(*at) <= self.span {
                break;
            }
            self.in_window -= *bytes;
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_decays_as_samples_expire() {
        let mut r = Rate::new(Duration::from_secs(10));
        r.insert(1000);
        tokio::time::advance(Duration::from_secs(5)).await;
        r.insert(1000);
        assert_eq!(r.rate(), 200);
        assert_eq!(r.total(), 2000);

        tokio::time::advance(Duration::from_secs(6)).await;
        // First sample fell out of the window.
        assert_eq!(r.rate(), 100);
        assert_eq!(r.total(), 2000);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(r.rate(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_instant_samples_coalesce() {
        let mut r = Rate::new(Duration::from_secs(10));
        r.insert(10);
        r.insert(20);
        assert_eq!(r.samples.len(), 1);
        assert_eq!(r.rate(), 3);
    }
}
