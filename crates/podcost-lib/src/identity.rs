//! Workload identity cache
//!
//! The kubelet reports pod metrics by namespace and name only. The watch
//! layer keeps this cache filled with the uid of every live pod so that
//! samples can be attached to a stable identity before they are persisted.

use crate::models::WorkloadKey;
use dashmap::DashMap;
use tracing::debug;

/// Concurrent (namespace, name) -> uid map
#[derive(Debug, Default)]
pub struct WorkloadIdentityCache {
    uids: DashMap<WorkloadKey, String>,
}

impl WorkloadIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the uid for a pod
    pub fn resolve(&self, key: &WorkloadKey) -> Option<String> {
        self.uids.get(key).map(|uid| uid.value().clone())
    }

    /// Record the uid of a pod, replacing any previous one
    pub fn store(&self, key: WorkloadKey, uid: impl Into<String>) {
        self.uids.insert(key, uid.into());
    }

    /// Remove the entry only if it still points at `uid`.
    ///
    /// A pod recreated under the same name gets a fresh uid; a late delete
    /// notification for the old pod must not evict the new mapping.
    pub fn compare_and_remove(&self, key: &WorkloadKey, uid: &str) -> bool {
        let removed = self.uids.remove_if(key, |_, current| current == uid).is_some();
        if !removed {
            debug!(workload = %key, uid = %uid, "Identity entry kept, uid changed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_store_and_resolve() {
        let cache = WorkloadIdentityCache::new();
        let key = WorkloadKey::new("default", "web-0");

        assert!(cache.resolve(&key).is_none());

        cache.store(key.clone(), "uid-1");
        assert_eq!(cache.resolve(&key).as_deref(), Some("uid-1"));

        cache.store(key.clone(), "uid-2");
        assert_eq!(cache.resolve(&key).as_deref(), Some("uid-2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_compare_and_remove_matching_uid() {
        let cache = WorkloadIdentityCache::new();
        let key = WorkloadKey::new("default", "web-0");
        cache.store(key.clone(), "uid-1");

        assert!(cache.compare_and_remove(&key, "uid-1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_compare_and_remove_keeps_recreated_pod() {
        let cache = WorkloadIdentityCache::new();
        let key = WorkloadKey::new("default", "web-0");

        // Pod recreated before the delete of the old one was observed
        cache.store(key.clone(), "uid-new");

        assert!(!cache.compare_and_remove(&key, "uid-old"));
        assert_eq!(cache.resolve(&key).as_deref(), Some("uid-new"));
    }

    #[tokio::test]
    async fn test_concurrent_writers_and_readers() {
        let cache = Arc::new(WorkloadIdentityCache::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..100 {
                    let key = WorkloadKey::new(format!("ns-{}", i), format!("pod-{}", j));
                    cache.store(key.clone(), format!("{}-{}", i, j));
                    assert!(cache.resolve(&key).is_some());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.len(), 800);
    }
}
