//! Cumulative service counters, kept in the shared store so every instance
//! adds to the same totals.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::shared_store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    WebhooksReceived,
    WebhooksRejected,
    JobsCompleted,
    JobsFailed,
    TasksCreated,
    RateLimited,
}

impl Counter {
    pub const ALL: [Counter; 6] = [
        Counter::WebhooksReceived,
        Counter::WebhooksRejected,
        Counter::JobsCompleted,
        Counter::JobsFailed,
        Counter::TasksCreated,
        Counter::RateLimited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::WebhooksReceived => "webhooks_received",
            Counter::WebhooksRejected => "webhooks_rejected",
            Counter::JobsCompleted => "jobs_completed",
            Counter::JobsFailed => "jobs_failed",
            Counter::TasksCreated => "tasks_created",
            Counter::RateLimited => "rate_limited",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    store: Arc<dyn SharedStore>,
}

impl Metrics {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn incr(&self, counter: Counter) {
        self.add(counter, 1).await;
    }

    /// Never fails the caller; a lost increment is only logged.
    pub async fn add(&self, counter: Counter, by: u64) {
        if by == 0 {
            return;
        }
        if let Err(e) = self.store.incr_counter(counter.as_str(), by).await {
            warn!(counter = counter.as_str(), "Failed to record metric: {e}");
        }
    }

    /// Every known counter, zero when never incremented.
    pub async fn snapshot(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        let mut counters = self.store.counters().await?;
        for counter in Counter::ALL {
            counters.entry(counter.as_str().to_string()).or_insert(0);
        }
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_store::MemorySharedStore;

    #[tokio::test]
    async fn test_snapshot_lists_every_counter() {
        let metrics = Metrics::new(Arc::new(MemorySharedStore::new()));
        metrics.incr(Counter::JobsCompleted).await;
        metrics.add(Counter::TasksCreated, 3).await;

        let snapshot = metrics.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), Counter::ALL.len());
        assert_eq!(snapshot["jobs_completed"], 1);
        assert_eq!(snapshot["tasks_created"], 3);
        assert_eq!(snapshot["webhooks_rejected"], 0);
    }
}
