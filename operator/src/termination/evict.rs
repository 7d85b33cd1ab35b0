//! The eviction queue: a deduped, rate-limited worker that evicts pods off
//! draining nodes. Disruption-budget rejections (429) back off per pod; the
//! global token bucket caps cluster-wide eviction pressure.

use kube::api::{DeleteParams, EvictParams};
use kube::{Api, Client};
use k8s_openapi::api::core::v1::Pod;
use owo_colors::OwoColorize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratus_common::wait::backoff_full_jitter;
use tokio::sync::mpsc;
use tokio::time::Instant;

const EVICTION_GRACE_SECONDS: i64 = 30;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvictionTarget {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

struct QueueItem {
    target: EvictionTarget,
    attempt: usize,
}

/// Simple token bucket: `rate` tokens per second up to `burst`.
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        TokenBucket {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last: Instant::now(),
        }
    }

    async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            self.tokens = (self.tokens + now.duration_since(self.last).as_secs_f64() * self.rate)
                .min(self.burst);
            self.last = now;
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let deficit = (1.0 - self.tokens) / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(deficit)).await;
        }
    }
}

#[derive(Clone)]
pub struct EvictionQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    queued: Arc<Mutex<HashSet<String>>>,
}

impl EvictionQueue {
    pub fn new(client: Client, rate: f64, burst: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(worker(client, rx, tx.clone(), queued.clone(), rate, burst));
        EvictionQueue { tx, queued }
    }

    /// Adds targets, dropping any already in flight (keyed by pod UID).
    pub fn enqueue(&self, targets: impl IntoIterator<Item = EvictionTarget>) {
        for target in targets {
            if self.queued.lock().unwrap().insert(target.uid.clone()) {
                let _ = self.tx.send(QueueItem { target, attempt: 0 });
            }
        }
    }
}

async fn worker(
    client: Client,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    tx: mpsc::UnboundedSender<QueueItem>,
    queued: Arc<Mutex<HashSet<String>>>,
    rate: f64,
    burst: u32,
) {
    let mut bucket = TokenBucket::new(rate, burst);
    while let Some(item) = rx.recv().await {
        bucket.acquire().await;
        let api: Api<Pod> = Api::namespaced(client.clone(), &item.target.namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(EVICTION_GRACE_SECONDS as u32),
                ..Default::default()
            }),
            ..Default::default()
        };
        match api.evict(&item.target.name, &params).await {
            Ok(_) => {
                queued.lock().unwrap().remove(&item.target.uid);
                #[cfg(feature = "metrics")]
                crate::util::metrics::EVICTIONS
                    .with_label_values(&["evicted"])
                    .inc();
            }
            // 429 is the disruption-budget saying "not yet".
            Err(kube::Error::Api(ae)) if ae.code == 429 => {
                #[cfg(feature = "metrics")]
                crate::util::metrics::EVICTIONS
                    .with_label_values(&["blocked"])
                    .inc();
                let delay = backoff_full_jitter(BACKOFF_BASE, BACKOFF_CAP, item.attempt);
                let retry = QueueItem {
                    target: item.target,
                    attempt: item.attempt + 1,
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(retry);
                });
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                queued.lock().unwrap().remove(&item.target.uid);
            }
            Err(e) => {
                eprintln!(
                    "{}",
                    format!(
                        "eviction of {}/{} failed: {e}",
                        item.target.namespace, item.target.name
                    )
                    .red()
                );
                // Drop it; the drain loop re-enqueues on its next pass.
                queued.lock().unwrap().remove(&item.target.uid);
                #[cfg(feature = "metrics")]
                crate::util::metrics::EVICTIONS
                    .with_label_values(&["error"])
                    .inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_enforces_rate_after_burst() {
        let mut bucket = TokenBucket::new(10.0, 2);
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        // Burst exhausted; the third token takes ~100ms of refill.
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
