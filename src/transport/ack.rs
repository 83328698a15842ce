use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Outstanding request/acknowledge exchanges, keyed by ack id.
#[derive(Debug, Default)]
pub struct AckRegistry {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Value>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (u64, oneshot::Receiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Delivers a reply. Each id resolves at most once.
    pub fn resolve(&self, id: u64, reply: Value) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                debug!(ack_id = id, "ack for unknown or already resolved request");
                false
            }
        }
    }

    /// Drops waiters whose receiver went away.
    pub fn prune(&self) {
        self.pending.retain(|_, tx| !tx.is_closed());
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drops every waiter without a reply. Returns how many were waiting.
    pub fn fail_all(&self) -> usize {
        let waiting = self.pending.len();
        self.pending.clear();
        waiting
    }

    pub fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::AckRegistry;

    #[tokio::test]
    async fn ack_resolves_exactly_once() {
        let registry = AckRegistry::new();
        let (id, rx) = registry.register();

        assert!(registry.resolve(id, json!({ "success": true })));
        assert!(!registry.resolve(id, json!({ "success": false })));
        assert_eq!(rx.await.unwrap(), json!({ "success": true }));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn prune_drops_abandoned_waiters() {
        let registry = AckRegistry::new();
        let (_id, rx) = registry.register();
        drop(rx);

        registry.prune();
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn fail_all_releases_every_waiter() {
        let registry = AckRegistry::new();
        let (_first, first_rx) = registry.register();
        let (second, second_rx) = registry.register();
        registry.cancel(second);

        assert_eq!(registry.fail_all(), 1);
        assert!(first_rx.await.is_err());
        assert!(second_rx.await.is_err());
        assert_eq!(registry.pending(), 0);
    }
}
