//! Rate limiting (C4), grounded in `pkg/manager/ratelimit.go`. The actual
//! counter storage is a pluggable `RateLimitStore` so a fleet can share
//! limits across processes (via Redis, see `redis_store.rs`) or run
//! entirely in-process (the default `NoopStore`).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::closer::Closer;
use crate::errors::Error;

/// A shared counter store with TTL semantics, the minimum a distributed
/// rate limiter needs: read a count, increment it, set an expiry the first
/// time a key is touched, and read the remaining TTL to know how long to
/// back off.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<u64>, Error>;
    async fn incr(&self, key: &str) -> Result<u64, Error>;
    async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<(), Error>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Error>;

    /// Liveness check used by the idle keep-alive (spec.md §4.4). Default
    /// implementation just re-uses `get` against a well-known key, which is
    /// enough to detect a dead store without needing a dedicated wire
    /// command; `RedisStore` overrides this with a real `PING`.
    async fn ping(&self) -> Result<(), Error> {
        self.get("twitch-irc-ratelimit-keepalive").await?;
        Ok(())
    }
}

/// The default store: every Manager gets its own counters, reset only when
/// the process restarts. Fine for a single-process fleet; a multi-process
/// deployment wants `redis_store::RedisStore` instead.
#[derive(Default)]
pub struct NoopStore {
    counters: parking_lot::Mutex<std::collections::HashMap<String, (u64, std::time::Instant, Duration)>>,
}

#[async_trait]
impl RateLimitStore for NoopStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.counters.lock().get(key).map(|(count, _, _)| *count))
    }

    async fn incr(&self, key: &str) -> Result<u64, Error> {
        let mut counters = self.counters.lock();
        let entry = counters
            .entry(key.to_owned())
            .or_insert((0, std::time::Instant::now(), Duration::from_secs(0)));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut counters = self.counters.lock();
        let entry = counters
            .entry(key.to_owned())
            .or_insert((0, std::time::Instant::now(), ttl));
        entry.1 = std::time::Instant::now();
        entry.2 = ttl;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Error> {
        let counters = self.counters.lock();
        Ok(counters.get(key).and_then(|(_, set_at, ttl)| {
            let elapsed = set_at.elapsed();
            if elapsed >= *ttl {
                None
            } else {
                Some(*ttl - elapsed)
            }
        }))
    }
}

/// Enforces the Join and Auth rate limits ahead of an action that would
/// count against them: increments the counter, and if it's now over the
/// limit, sleeps until the window resets (plus jitter, so a thundering herd
/// of waiters doesn't all retry in lockstep).
pub struct RateLimiter {
    store: std::sync::Arc<dyn RateLimitStore>,
    join_key: String,
    auth_key: String,
    join_limit: u32,
    auth_limit: u32,
    reset_window: Duration,
}

impl RateLimiter {
    pub fn new(
        store: std::sync::Arc<dyn RateLimitStore>,
        join_key: impl Into<String>,
        auth_key: impl Into<String>,
        join_limit: u32,
        auth_limit: u32,
        reset_window: Duration,
    ) -> Self {
        RateLimiter {
            store,
            join_key: join_key.into(),
            auth_key: auth_key.into(),
            join_limit,
            auth_limit,
            reset_window,
        }
    }

    /// `cancel` is an external cancellation token (spec.md §5): a fired
    /// `Closer` interrupts a pending backoff sleep and returns
    /// `Error::Cancelled` instead of retrying. The Manager passes its own
    /// `isClosing` signal here, so a `Shutdown()` racing a rate-limited Join
    /// doesn't hang until the next window.
    pub async fn wait_to_join(&self, cancel: &Closer) -> Result<(), Error> {
        self.wait_for(&self.join_key, self.join_limit, cancel).await
    }

    pub async fn wait_to_auth(&self, cancel: &Closer) -> Result<(), Error> {
        self.wait_for(&self.auth_key, self.auth_limit, cancel).await
    }

    async fn wait_for(&self, key: &str, limit: u32, cancel: &Closer) -> Result<(), Error> {
        loop {
            if cancel.is_fired() {
                return Err(Error::Cancelled);
            }
            if self.store.ttl(key).await?.is_none() {
                self.store.set_ttl(key, self.reset_window).await?;
            }
            let count = self.store.incr(key).await?;
            if count as u32 <= limit {
                return Ok(());
            }
            let backoff = self.store.ttl(key).await?.unwrap_or(self.reset_window);
            let jitter_ms = rand::thread_rng().gen_range(50, 2000);
            tokio::select! {
                _ = tokio::time::delay_for(backoff + Duration::from_millis(jitter_ms)) => {}
                _ = cancel.wait() => return Err(Error::Cancelled),
            }
        }
    }

    /// Idle keep-alive: pings the store every 10s (spec.md §4.4) until
    /// `cancel` fires. A ping failure is reported to `on_failure` and the
    /// loop keeps running — it doesn't cancel pending `wait_to_join`/
    /// `wait_to_auth` callers, which have their own cancellation path.
    pub async fn run_keepalive(&self, cancel: &Closer, on_failure: impl Fn(Error)) {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.wait() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.store.ping().await {
                        on_failure(e);
                    }
                }
            }
        }
    }
}
