use governor::{
    clock::QuantaClock,
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter
};
use std::{
    net::IpAddr,
    num::NonZeroU32,
    sync::Arc,
};
use tracing::{debug, warn};

use crate::store::SharedStore;
use crate::utils::error::ChatError;

/// A rate limiter for managing connection attempts per client IP.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    /// The underlying rate limiter instance, shared by all accept tasks.
    limiter: Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, QuantaClock, NoOpMiddleware>>,
}

impl ConnectionRateLimiter {
    /// Creates a new `ConnectionRateLimiter` with a specified rate limit.
    ///
    /// # Arguments
    ///
    /// * `per_second` - The maximum number of new connections allowed per second per IP.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::ConfigurationError` if `per_second` is zero.
    pub fn new(per_second: u32) -> Result<Self, ChatError> {
        let burst_size = NonZeroU32::new(per_second).ok_or_else(|| {
            ChatError::ConfigurationError("connection_rate_limit must be greater than 0".into())
        })?;

        Ok(Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_second(burst_size))),
        })
    }

    /// Checks whether a new connection from `ip` is allowed right now.
    ///
    /// Never waits: a client over its quota is refused instead of being
    /// parked until the quota refills.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }
}

/// Fixed-window message limiter keyed by (room, username).
///
/// Each call increments a shared counter. The increment attaches the window
/// length as the key's expiry whenever the key has none, in the same atomic
/// step, so the counter resets by expiring rather than by decrement. Bursts straddling a window boundary can
/// pass up to twice the nominal rate.
///
/// When the counter store cannot be reached the limiter fails open: the
/// message is admitted and a warning is logged.
#[derive(Clone)]
pub struct MessageRateLimiter {
    store: Arc<dyn SharedStore>,
    max_messages: u32,
    window_secs: u64,
}

impl MessageRateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, max_messages: u32, window_secs: u64) -> Self {
        Self {
            store,
            max_messages,
            window_secs,
        }
    }

    pub fn max_messages(&self) -> u32 {
        self.max_messages
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Counter key for (room, username). The room's byte length is part of
    /// the key, so names containing `:` cannot collide.
    fn key(room: &str, username: &str) -> String {
        format!("rl:{}:{}:{}", room.len(), room, username)
    }

    /// Counts one message for `username` in `room` and reports whether it may pass.
    pub async fn allow(&self, room: &str, username: &str) -> bool {
        let key = Self::key(room, username);

        let count = match self.store.incr_window(&key, self.window_secs).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Rate limiter store unavailable, admitting message: {}", e);
                return true;
            }
        };

        let allowed = count <= i64::from(self.max_messages);
        if !allowed {
            debug!("Rate limit hit for {} in {} ({} msgs)", username, room, count);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn connection_limiter_refuses_burst() {
        let limiter = ConnectionRateLimiter::new(2).unwrap();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
        assert!(limiter.check(other));
    }

    #[test]
    fn zero_connection_rate_is_a_config_error() {
        assert!(matches!(
            ConnectionRateLimiter::new(0),
            Err(ChatError::ConfigurationError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_max_within_window() {
        let store = Arc::new(MemoryStore::new());
        let limiter = MessageRateLimiter::new(store, 5, 5);

        for _ in 0..5 {
            assert!(limiter.allow("lobby", "alice").await);
        }
        assert!(!limiter.allow("lobby", "alice").await);
        assert!(!limiter.allow("lobby", "alice").await);

        // Other users and rooms have their own counters.
        assert!(limiter.allow("lobby", "bob").await);
        assert!(limiter.allow("garden", "alice").await);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_by_expiry() {
        let store = Arc::new(MemoryStore::new());
        let limiter = MessageRateLimiter::new(store, 2, 5);

        assert!(limiter.allow("lobby", "alice").await);
        assert!(limiter.allow("lobby", "alice").await);
        assert!(!limiter.allow("lobby", "alice").await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.allow("lobby", "alice").await);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_attempts_do_not_extend_the_window() {
        let store = Arc::new(MemoryStore::new());
        let limiter = MessageRateLimiter::new(store, 2, 5);

        assert!(limiter.allow("lobby", "alice").await);
        assert!(limiter.allow("lobby", "alice").await);
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(!limiter.allow("lobby", "alice").await);
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.allow("lobby", "alice").await);
    }

    #[test]
    fn keys_do_not_collide_across_colons() {
        assert_ne!(
            MessageRateLimiter::key("a:b", "c"),
            MessageRateLimiter::key("a", "b:c")
        );
        assert_eq!(MessageRateLimiter::key("lobby", "alice"), "rl:5:lobby:alice");
    }

    #[tokio::test(start_paused = true)]
    async fn colon_names_count_separately() {
        let store = Arc::new(MemoryStore::new());
        let limiter = MessageRateLimiter::new(store, 1, 60);

        assert!(limiter.allow("a:b", "c").await);
        assert!(limiter.allow("a", "b:c").await);
        assert!(!limiter.allow("a:b", "c").await);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        let limiter = MessageRateLimiter::new(store.clone(), 1, 60);
        assert!(limiter.allow("lobby", "alice").await);
        assert!(!limiter.allow("lobby", "alice").await);

        store.set_available(false);
        assert!(limiter.allow("lobby", "alice").await);
    }
}
