use std::{collections::VecDeque, time::Duration};

use tokio::{
    sync::Mutex,
    time::{sleep_until, Instant},
};

const WINDOW: Duration = Duration::from_secs(60);

/// Keeps the number of requests in any rolling one-minute window at or below a fixed limit.
pub struct RateLimiter {
    // Invariant: sorted from oldest to newest, never longer than `limit`
    sent: Mutex<VecDeque<Instant>>,
    limit: usize,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize) -> Self {
        let limit = requests_per_minute.max(1);

        Self {
            sent: Mutex::new(VecDeque::with_capacity(limit)),
            limit,
        }
    }

    /// Waits until one more request fits in the window, then records it.
    pub async fn throttle_request(&self) {
        let mut sent = self.sent.lock().await;

        let now = Instant::now();
        while matches!(sent.front(), Some(&instant) if now.duration_since(instant) >= WINDOW) {
            sent.pop_front();
        }

        if sent.len() >= self.limit {
            // The window is full; the oldest request has to age out first
            if let Some(oldest) = sent.pop_front() {
                sleep_until(oldest + WINDOW).await;
            }
        }

        sent.push_back(Instant::now());
    }

    #[cfg(test)]
    async fn in_window(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn requests_under_the_limit_are_not_delayed() {
        let limiter = RateLimiter::new(3);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.throttle_request().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_waits_for_the_oldest_request() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();

        limiter.throttle_request().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.throttle_request().await;
        limiter.throttle_request().await;

        assert_eq!(start.elapsed(), WINDOW);
        assert_eq!(limiter.in_window().await, 2);
    }
}
