//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Upsync messages a session may send per second.
///
/// Clients batch one input frame every `1 << input_scale_frames` render frames,
/// plus heartbeats, so this leaves room for bursts after a stall.
pub const UPSYNC_RATE_LIMIT: u32 = 120;

/// Per-session limiter for inbound upsyncs
#[derive(Clone)]
pub struct SessionRateLimiter {
    upsync_limiter: Arc<Limiter>,
}

impl SessionRateLimiter {
    pub fn new() -> Self {
        Self::with_rate(UPSYNC_RATE_LIMIT)
    }

    pub fn with_rate(per_second: u32) -> Self {
        Self {
            upsync_limiter: create_limiter(per_second),
        }
    }

    /// Check if an upsync message is allowed (returns true if allowed)
    pub fn check_upsync(&self) -> bool {
        self.upsync_limiter.check().is_ok()
    }
}

impl Default for SessionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
