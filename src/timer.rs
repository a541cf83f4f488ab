//! Timer helpers: windowed allowance and reconnect backoff

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Identify rate window enforced by the gateway per concurrency bucket
pub const IDENTIFY_WINDOW: Duration = Duration::from_secs(5);

/// At most `capacity` acquisitions per window
///
/// Once the allowance is exhausted the next acquisition waits one full
/// window and refills. Callers are expected to acquire sequentially (the
/// spawn queue is the only user), so the wait happens outside the lock.
#[derive(Debug)]
pub struct WindowAllowance {
    window: Duration,
    state: Mutex<AllowanceState>,
}

#[derive(Debug)]
struct AllowanceState {
    capacity: u32,
    remaining: u32,
}

impl WindowAllowance {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            window,
            state: Mutex::new(AllowanceState {
                capacity,
                remaining: capacity,
            }),
        }
    }

    /// Replace the capacity and refill (used once discovery reports it)
    pub fn set_capacity(&self, capacity: u32) {
        let capacity = capacity.max(1);
        let mut state = self.state.lock();
        state.capacity = capacity;
        state.remaining = capacity;
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().capacity
    }

    pub fn remaining(&self) -> u32 {
        self.state.lock().remaining
    }

    /// Take one unit, waiting out the window first if none are left
    pub async fn acquire(&self) {
        let exhausted = self.state.lock().remaining == 0;
        if exhausted {
            debug!(window = ?self.window, "Allowance exhausted, waiting for window");
            tokio::time::sleep(self.window).await;
            let mut state = self.state.lock();
            state.remaining = state.capacity;
        }
        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(1);
    }
}

/// Capped exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay for the next attempt; doubles each call up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Remaining time until `deadline`, `None` once it has passed
pub fn until(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    (deadline > now).then(|| deadline - now)
}
