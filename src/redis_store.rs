//! Redis-backed `RateLimitStore`, enabled by the `redis-store` feature.
//! Grounded in the `plsuwu-pea-fan` example's use of `redis`'s async
//! connection manager for shared, multi-process counters.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::errors::Error;
use crate::rate_limiter::RateLimitStore;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| Error::RateLimitStore(Box::new(e)))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| Error::RateLimitStore(Box::new(e)))?;
        Ok(RedisStore { conn })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, Error> {
        self.conn
            .clone()
            .get(key)
            .await
            .map_err(|e| Error::RateLimitStore(Box::new(e)))
    }

    async fn incr(&self, key: &str) -> Result<u64, Error> {
        self.conn
            .clone()
            .incr(key, 1)
            .await
            .map_err(|e| Error::RateLimitStore(Box::new(e)))
    }

    /// `EXPIRE` is a no-op on a key that doesn't exist yet, which is exactly
    /// the case this is called for (spec.md §4.4: "if absent, set to 0 with
    /// TTL = reset window first"). `SET key 0 EX ttl` creates the key with
    /// both the zeroed value and the TTL in one round trip, matching the
    /// original's `Set(ctx, key, 0, r.reset)`.
    async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        self.conn
            .clone()
            .set_ex(key, 0u64, ttl.as_secs() as usize)
            .await
            .map_err(|e| Error::RateLimitStore(Box::new(e)))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Error> {
        let secs: i64 = self
            .conn
            .clone()
            .ttl(key)
            .await
            .map_err(|e| Error::RateLimitStore(Box::new(e)))?;
        Ok(if secs > 0 {
            Some(Duration::from_secs(secs as u64))
        } else {
            None
        })
    }

    async fn ping(&self) -> Result<(), Error> {
        redis::cmd("PING")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Error::RateLimitStore(Box::new(e)))
    }
}
