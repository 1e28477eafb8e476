use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{info, warn};
use uuid::Uuid;

use super::{SharedStore, WindowHit};
use crate::reliability::retry::{retry_with_backoff, RetryPolicy};

const KEY_PREFIX: &str = "threadwise";

/// Sliding-window log in a sorted set scored by hit time (ms). Trims hits
/// older than the window, admits this one if there is room, and returns
/// `{count, ms until the oldest admitted hit expires}`.
static SLIDING_WINDOW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local limit = tonumber(ARGV[3])
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
        local count = redis.call('ZCARD', KEYS[1]) + 1
        if count <= limit then
            redis.call('ZADD', KEYS[1], now, ARGV[4])
        end
        redis.call('PEXPIRE', KEYS[1], window)
        local resets = window
        local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
        if oldest[2] then
            resets = tonumber(oldest[2]) + window - now
        end
        return {count, resets}
        "#,
    )
});

/// Redis-backed store; safe across any number of service instances.
#[derive(Clone)]
pub struct RedisSharedStore {
    conn: MultiplexedConnection,
}

impl RedisSharedStore {
    /// Connects with the default backoff, so a Redis that starts alongside
    /// the service does not fail the boot.
    pub async fn connect(client: &redis::Client) -> Result<Self> {
        let conn = retry_with_backoff(
            &RetryPolicy::default(),
            || client.get_multiplexed_async_connection(),
            |attempt, err| warn!(attempt, "Redis not reachable yet: {err}"),
        )
        .await
        .context("Failed to connect to Redis")?;
        info!("Redis shared store connected");
        Ok(Self { conn })
    }

    fn key(kind: &str, id: &str) -> String {
        format!("{KEY_PREFIX}:{kind}:{id}")
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().max(1) as u64
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    async fn hit_window(&self, key: &str, window: Duration, limit: u32) -> Result<WindowHit> {
        let key = Self::key("rl", key);
        let mut conn = self.conn.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());

        let (count, resets_ms): (u64, i64) = SLIDING_WINDOW
            .key(&key)
            .arg(now_ms)
            .arg(millis(window))
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowHit {
            count: count.min(u32::MAX as u64) as u32,
            resets_in: Duration::from_millis(resets_ms.max(0) as u64),
        })
    }

    async fn incr_counter(&self, name: &str, by: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let total: i64 = redis::cmd("HINCRBY")
            .arg(format!("{KEY_PREFIX}:metrics"))
            .arg(name)
            .arg(by)
            .query_async(&mut conn)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn counters(&self) -> Result<BTreeMap<String, u64>> {
        let mut conn = self.conn.clone();
        let all: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(format!("{KEY_PREFIX}:metrics"))
            .query_async(&mut conn)
            .await?;
        Ok(all.into_iter().collect())
    }

    async fn put_token(&self, token: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(Self::key("token", token))
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn take_token(&self, token: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(Self::key("token", token))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn claim_once(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(Self::key("claim", key))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn release_claim(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(Self::key("claim", key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
