use crate::ring::StreamCoordinator;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Directory of per-channel coordinators.
///
/// `get_or_create` guarantees exactly one coordinator per stream ID even
/// under racing creators; a background sweep reclaims entries that have had
/// no clients at the instant of check. Removal is safe: the next request
/// simply recreates the coordinator, and any in-flight writer owning a
/// removed one runs its own shutdown path to completion.
pub struct StreamRegistry {
    coordinators: RwLock<HashMap<String, Arc<StreamCoordinator>>>,
    buffer_size: usize,
}

impl StreamRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            coordinators: RwLock::new(HashMap::new()),
            buffer_size,
        }
    }

    pub fn get_or_create(&self, stream_id: &str) -> Arc<StreamCoordinator> {
        if let Some(coordinator) = self.coordinators.read().get(stream_id) {
            return Arc::clone(coordinator);
        }

        let mut coordinators = self.coordinators.write();
        // A racing creator may have won between the locks; its entry wins
        // and our candidate is never built.
        Arc::clone(
            coordinators
                .entry(stream_id.to_owned())
                .or_insert_with(|| {
                    debug!(stream_id, "Created coordinator");
                    Arc::new(StreamCoordinator::new(stream_id, self.buffer_size))
                }),
        )
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamCoordinator>> {
        self.coordinators.read().get(stream_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.coordinators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.read().is_empty()
    }

    /// One sweep pass: drop every entry with zero clients. Returns how many
    /// were removed.
    pub fn sweep_idle(&self) -> usize {
        let mut coordinators = self.coordinators.write();
        let before = coordinators.len();
        coordinators.retain(|stream_id, coordinator| {
            let keep = coordinator.client_count() > 0;
            if !keep {
                trace!(stream_id, "Sweeping idle coordinator");
            }
            keep
        });
        before - coordinators.len()
    }

    /// Spawn the periodic idle sweep, stopped by `token`.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Registry sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let removed = registry.sweep_idle();
                        if removed > 0 {
                            debug!(removed, remaining = registry.len(), "Swept idle coordinators");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_the_same_coordinator() {
        let registry = StreamRegistry::new(4);
        let a = registry.get_or_create("ch");
        let b = registry.get_or_create("ch");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn racing_creators_converge_on_one_entry() {
        let registry = Arc::new(StreamRegistry::new(4));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.get_or_create("ch") }));
        }
        let mut coordinators = Vec::new();
        for handle in handles {
            coordinators.push(handle.await.unwrap());
        }
        assert!(coordinators.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_idle_entries() {
        let registry = StreamRegistry::new(4);
        let busy = registry.get_or_create("busy");
        busy.register_client().unwrap();
        registry.get_or_create("idle");

        assert_eq!(registry.sweep_idle(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("busy").is_some());
        assert!(registry.get("idle").is_none());

        busy.unregister_client();
    }

    #[tokio::test]
    async fn removed_coordinator_is_recreated_fresh() {
        let registry = StreamRegistry::new(4);
        let first = registry.get_or_create("ch");
        registry.sweep_idle();

        let second = registry.get_or_create("ch");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn sweeper_task_runs_until_cancelled() {
        let registry = Arc::new(StreamRegistry::new(4));
        registry.get_or_create("idle");

        let token = CancellationToken::new();
        registry.start_sweeper(Duration::from_millis(10), token.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty());
        token.cancel();
    }
}
