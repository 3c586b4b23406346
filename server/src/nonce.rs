//! Replay-detection cache for authenticated admin requests.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// TTL set of previously seen nonces. Entries expire after their TTL and are
/// reaped by a periodic sweep; `has` never reports an expired entry.
#[derive(Default)]
pub struct NonceCache {
    entries: DashMap<String, u64>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, nonce: &str, ttl: Duration) {
        self.entries
            .insert(nonce.to_string(), now_ms() + ttl.as_millis() as u64);
    }

    pub fn has(&self, nonce: &str) -> bool {
        match self.entries.get(nonce) {
            Some(expiry) => *expiry > now_ms(),
            None => false,
        }
    }

    /// Drops expired entries.
    pub fn sweep(&self) {
        let now = now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "swept nonce cache");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawns the periodic sweeper. The task dies with the runtime and never
    /// holds the process open on its own.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}
