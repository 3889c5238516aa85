//! Shared outbound rate limiting for accrual queries.
//!
//! Every query cycle, regardless of which order it belongs to, takes one
//! permit before touching the network. The limiter is an injected capability
//! so tests can swap in [`Unlimited`].

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Issues permits for outbound requests.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until a permit is available.
    ///
    /// Dropping the returned future abandons the wait; callers race it
    /// against their cancellation token.
    async fn acquire(&self);
}

/// Paces permits evenly: one every `60s / per_minute`.
///
/// Bursts are not accumulated while idle, so the aggregate rate never
/// exceeds the quota over any window longer than one interval.
#[derive(Debug)]
pub struct PacedLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl PacedLimiter {
    pub fn per_minute(permits: NonZeroU32) -> Self {
        let interval_ns = Duration::from_secs(60).as_nanos() / u128::from(permits.get());
        Self::with_interval(Duration::from_nanos(interval_ns as u64))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next free slot and return when it opens.
    async fn reserve(&self) -> Instant {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot
    }
}

#[async_trait]
impl RateLimiter for PacedLimiter {
    async fn acquire(&self) {
        let slot = self.reserve().await;
        tokio::time::sleep_until(slot).await;
    }
}

/// Grants every permit immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self) {}
}
