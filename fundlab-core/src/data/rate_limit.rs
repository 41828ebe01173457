//! Requests-per-minute ceiling.
//!
//! A spacing limiter: each acquisition reserves the next free slot, slots are
//! `60s / rpm` apart. Callers past the ceiling are queued (they sleep until
//! their slot), never rejected.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            interval: Duration::from_secs(60) / requests_per_minute.max(1),
            next_slot: Mutex::new(None),
        }
    }

    /// Minimum spacing between two requests.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next request slot.
    pub async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
