// SPDX-License-Identifier: MIT OR Apache-2.0
//! Token-bucket admission control per model tier.
//!
//! Requests over budget wait up to the grace window for a refill, then fail
//! with `rate_limited`.

use crate::LlmError;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long an over-budget request may wait for a refill.
pub const ACQUIRE_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket admitting `capacity` requests per minute.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket admitting `per_minute` requests per minute, starting
    /// full.
    #[must_use]
    pub fn per_minute(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, waiting up to [`ACQUIRE_GRACE`] for a refill.
    pub async fn acquire(&self) -> Result<(), LlmError> {
        let deadline = Instant::now() + ACQUIRE_GRACE;
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LlmError::RateLimited);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Current token count, for diagnostics.
    #[must_use]
    pub fn available(&self) -> f64 {
        let state = self.state.lock().expect("bucket lock poisoned");
        state.tokens
    }
}
