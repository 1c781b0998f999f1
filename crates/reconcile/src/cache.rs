//! Read-mostly object cache keyed by namespace/name.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::Resource;
use rustc_hash::FxHashMap;
use tether_core::ReconcileKey;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    /// Full relist; replaces everything cached.
    Restarted(Vec<K>),
}

type Snapshot<K> = FxHashMap<ReconcileKey, Arc<K>>;

/// Readers load the current snapshot without locking; the single ingest task
/// swaps in a new one per event.
pub struct Cache<K> {
    snap: ArcSwap<Snapshot<K>>,
}

impl<K: Resource> Cache<K> {
    pub fn new() -> Self {
        Self { snap: ArcSwap::from_pointee(FxHashMap::default()) }
    }

    /// Apply one event and return the keys it touched, deleted ones included.
    /// Objects without a name are ignored.
    pub fn apply(&self, event: WatchEvent<K>) -> Vec<ReconcileKey> {
        match event {
            WatchEvent::Applied(obj) => {
                let Some(key) = ReconcileKey::for_resource(&obj) else { return Vec::new() };
                let mut next = (**self.snap.load()).clone();
                next.insert(key.clone(), Arc::new(obj));
                self.snap.store(Arc::new(next));
                vec![key]
            }
            WatchEvent::Deleted(obj) => {
                let Some(key) = ReconcileKey::for_resource(&obj) else { return Vec::new() };
                let mut next = (**self.snap.load()).clone();
                next.remove(&key);
                self.snap.store(Arc::new(next));
                vec![key]
            }
            WatchEvent::Restarted(items) => self.replace(items),
        }
    }

    /// Replace the whole snapshot. Returns every key present before or after.
    pub fn replace(&self, items: Vec<K>) -> Vec<ReconcileKey> {
        let next: Snapshot<K> = items
            .into_iter()
            .filter_map(|o| ReconcileKey::for_resource(&o).map(|k| (k, Arc::new(o))))
            .collect();
        let prev = self.snap.swap(Arc::new(next));
        let current = self.snap.load();
        let mut keys: Vec<ReconcileKey> = current.keys().cloned().collect();
        keys.extend(prev.keys().filter(|k| !current.contains_key(*k)).cloned());
        keys.sort();
        debug!(count = current.len(), removed = keys.len() - current.len(), "cache replaced");
        keys
    }

    pub fn get(&self, key: &ReconcileKey) -> Option<Arc<K>> {
        self.snap.load().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ReconcileKey> {
        let mut keys: Vec<_> = self.snap.load().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Resource> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    fn svc(name: &str, ip: &str) -> Service {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "namespace": "apps" },
            "spec": { "clusterIP": ip }
        }))
        .unwrap()
    }

    #[test]
    fn applied_and_deleted_touch_one_key() {
        let cache = Cache::new();
        assert_eq!(cache.apply(WatchEvent::Applied(svc("a", "1"))), vec![ReconcileKey::namespaced("apps", "a")]);
        cache.apply(WatchEvent::Applied(svc("a", "2")));
        let got = cache.get(&ReconcileKey::namespaced("apps", "a")).unwrap();
        assert_eq!(got.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("2"));
        cache.apply(WatchEvent::Deleted(svc("a", "2")));
        assert!(cache.is_empty());
    }

    #[test]
    fn restart_reports_removed_keys() {
        let cache = Cache::new();
        cache.apply(WatchEvent::Applied(svc("old", "1")));
        let keys = cache.apply(WatchEvent::Restarted(vec![svc("new", "1")]));
        assert_eq!(keys, vec![ReconcileKey::namespaced("apps", "new"), ReconcileKey::namespaced("apps", "old")]);
        assert_eq!(cache.keys(), vec![ReconcileKey::namespaced("apps", "new")]);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let cache = Cache::new();
        cache.apply(WatchEvent::Applied(svc("a", "1")));
        let held = cache.get(&ReconcileKey::namespaced("apps", "a")).unwrap();
        cache.apply(WatchEvent::Deleted(svc("a", "1")));
        assert_eq!(held.metadata.name.as_deref(), Some("a"));
    }
}
