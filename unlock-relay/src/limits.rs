//! Rate limiting for unlock-relay.
//!
//! Limits are keyed by authenticated [`UserId`]: one limiter for stream opens
//! and heartbeats, one for relayed sends, plus a global limiter capping
//! aggregate throughput. All use governor's keyed rate limiters backed by
//! DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use unlock_types::UserId;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Stream opens and heartbeats per user, `limits.opens_per_minute`.
    open_limiter: Arc<KeyedLimiter<UserId>>,
    /// Relayed sends per user, `limits.sends_per_minute`.
    send_limiter: Arc<KeyedLimiter<UserId>>,
    /// Aggregate cap across all users.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("open_limiter", &"KeyedLimiter<UserId>")
            .field("send_limiter", &"KeyedLimiter<UserId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are rejected by `Config::validate`; if one slips through
    /// it is treated as 1.
    pub fn new(config: &LimitsConfig) -> Self {
        let open_quota = Quota::per_minute(non_zero(config.opens_per_minute));
        let send_quota = Quota::per_minute(non_zero(config.sends_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_requests_per_second));

        Self {
            open_limiter: Arc::new(RateLimiter::keyed(open_quota)),
            send_limiter: Arc::new(RateLimiter::keyed(send_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a stream open or heartbeat is allowed for `user_id`.
    pub fn check_open(&self, user_id: &UserId) -> Result<(), RateLimitError> {
        self.check_global()?;
        self.open_limiter
            .check_key(user_id)
            .map_err(|_| RateLimitError::OpenLimitExceeded)
    }

    /// Check if a relayed send is allowed for `user_id`.
    pub fn check_send(&self, user_id: &UserId) -> Result<(), RateLimitError> {
        self.check_global()?;
        self.send_limiter
            .check_key(user_id)
            .map_err(|_| RateLimitError::SendLimitExceeded)
    }

    /// Check if the global request rate is within limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of users tracked by the open limiter.
    pub fn open_keys_count(&self) -> usize {
        self.open_limiter.len()
    }

    /// Number of users tracked by the send limiter.
    pub fn send_keys_count(&self) -> usize {
        self.send_limiter.len()
    }

    /// Evict idle users from the keyed limiters. Called by every reaper sweep.
    pub fn shrink(&self) {
        self.open_limiter.retain_recent();
        self.send_limiter.retain_recent();
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many stream opens or heartbeats from this user.
    #[error("stream open rate limit exceeded")]
    OpenLimitExceeded,
    /// Too many relayed messages from this user.
    #[error("send rate limit exceeded")]
    SendLimitExceeded,
    /// Global request rate exceeded across all users.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
