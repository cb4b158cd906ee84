//! Outbound dial throttling.
//!
//! Every websocket dial goes through a [`DialLimiter`] so reconnect storms
//! cannot trip upstream connection limits. The default is a small token
//! bucket; callers can substitute their own implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::{DEFAULT_DIAL_BURST, DEFAULT_DIAL_WINDOW};

/// Grants slots for outbound websocket dials.
#[async_trait]
pub trait DialLimiter: Send + Sync + 'static {
    /// Waits until a dial may proceed.
    async fn acquire(&self);
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    window_start: Instant,
}

/// Token bucket: `burst` tokens refilled to `burst` every `window`, with at
/// most `burst` callers in `acquire` at once.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    waiters: Semaphore,
    burst: u32,
    window: Duration,
}

impl TokenBucket {
    pub fn new(burst: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                window_start: Instant::now(),
            }),
            waiters: Semaphore::new(burst as usize),
            burst,
            window,
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_BURST, DEFAULT_DIAL_WINDOW)
    }
}

#[async_trait]
impl DialLimiter for TokenBucket {
    async fn acquire(&self) {
        let Ok(_permit) = self.waiters.acquire().await else {
            // Semaphore is never closed while the bucket is alive.
            return;
        };
        loop {
            let now = Instant::now();
            let mut state = self.state.lock().await;
            if now.duration_since(state.window_start) >= self.window {
                state.window_start = now;
                state.tokens = self.burst;
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let wake = state.window_start + self.window;
            drop(state);
            tokio::time::sleep_until(wake).await;
        }
    }
}
