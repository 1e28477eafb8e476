use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use super::{SharedStore, WindowHit};

/// Expired entries of every map are dropped at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Admitted hits of one key, oldest first.
struct Window {
    hits: VecDeque<Instant>,
    span: Duration,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while self.hits.front().is_some_and(|t| *t + self.span <= now) {
            self.hits.pop_front();
        }
    }

    fn is_empty_at(&self, now: Instant) -> bool {
        self.hits.back().map_or(true, |t| *t + self.span <= now)
    }
}

struct Expiring {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    windows: HashMap<String, Window>,
    counters: BTreeMap<String, u64>,
    tokens: HashMap<String, Expiring>,
    claims: HashMap<String, Instant>,
    last_sweep: Option<Instant>,
}

impl Inner {
    /// Drops every expired window, token and claim. Keys that are never
    /// touched again would otherwise stay forever.
    fn sweep(&mut self, now: Instant) {
        if self.last_sweep.is_some_and(|t| now.duration_since(t) < SWEEP_INTERVAL) {
            return;
        }
        self.last_sweep = Some(now);
        self.windows.retain(|_, w| !w.is_empty_at(now));
        self.tokens.retain(|_, t| t.expires_at > now);
        self.claims.retain(|_, expires_at| *expires_at > now);
    }
}

/// In-process store for single-instance deployments and tests.
/// One mutex guards all maps.
#[derive(Default)]
pub struct MemorySharedStore {
    inner: Mutex<Inner>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("shared store mutex poisoned"))
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn hit_window(&self, key: &str, window: Duration, limit: u32) -> Result<WindowHit> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.sweep(now);

        let entry = inner.windows.entry(key.to_string()).or_insert_with(|| Window {
            hits: VecDeque::new(),
            span: window,
        });
        entry.span = window;
        entry.prune(now);

        let count = u32::try_from(entry.hits.len()).unwrap_or(u32::MAX).saturating_add(1);
        if count <= limit {
            entry.hits.push_back(now);
        }
        let resets_in = entry
            .hits
            .front()
            .map_or(window, |t| (*t + window).saturating_duration_since(now));
        Ok(WindowHit { count, resets_in })
    }

    async fn incr_counter(&self, name: &str, by: u64) -> Result<u64> {
        let mut inner = self.lock()?;
        let value = inner.counters.entry(name.to_string()).or_insert(0);
        *value = value.saturating_add(by);
        Ok(*value)
    }

    async fn counters(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self.lock()?.counters.clone())
    }

    async fn put_token(&self, token: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.sweep(now);
        inner.tokens.insert(
            token.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn take_token(&self, token: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        Ok(inner
            .tokens
            .remove(token)
            .filter(|t| t.expires_at > now)
            .map(|t| t.value))
    }

    async fn claim_once(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.sweep(now);
        match inner.claims.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                inner.claims.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, key: &str) -> Result<()> {
        self.lock()?.claims.remove(key);
        Ok(())
    }
}
