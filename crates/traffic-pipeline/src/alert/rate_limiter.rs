//! Sliding-window rate limiter shared by every worker.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Allows at most `max` acquisitions in any trailing `window`.
///
/// Check and record happen under one lock, so concurrent callers can never
/// exceed the limit between them.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max: u32,
    window: Duration,
    sends: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            sends: Mutex::new(VecDeque::with_capacity(max as usize)),
        }
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut sends = self.lock();
        self.prune(&mut sends, now);

        if sends.len() >= self.max as usize {
            return false;
        }
        sends.push_back(now);
        true
    }

    /// Slots taken in the current window.
    pub fn in_window(&self) -> usize {
        let mut sends = self.lock();
        self.prune(&mut sends, Instant::now());
        sends.len()
    }

    /// Time until a slot frees up; `None` when one is free now.
    pub fn next_available(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut sends = self.lock();
        self.prune(&mut sends, now);

        if sends.len() < self.max as usize {
            return None;
        }
        sends
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(&self, sends: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = sends.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                sends.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.sends.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
