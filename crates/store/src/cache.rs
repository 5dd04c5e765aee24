//! Per-kind object cache fed by watch deltas.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bfe_core::{meta_key, Delta};
use kube::Resource;
use rustc_hash::FxHashMap;
use tracing::warn;

/// What a delta did to the cache, for handlers to act on.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Removed(Arc<K>),
}

pub struct Cache<K> {
    items: RwLock<FxHashMap<String, Arc<K>>>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self { Self { items: RwLock::new(FxHashMap::default()) } }
}

impl<K: Resource> Cache<K> {
    pub fn new() -> Self { Self::default() }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<String, Arc<K>>> { self.items.read().unwrap_or_else(|e| e.into_inner()) }
    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<String, Arc<K>>> { self.items.write().unwrap_or_else(|e| e.into_inner()) }

    pub fn get(&self, key: &str) -> Option<Arc<K>> { self.read().get(key).cloned() }
    pub fn list(&self) -> Vec<Arc<K>> { self.read().values().cloned().collect() }
    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Apply one delta. Deleting a key that is not cached changes nothing. A relist is diffed against current contents: unknown keys become
    /// additions, known keys updates, and keys missing from the snapshot removals.
    pub fn apply(&self, delta: Delta<K>) -> Vec<Change<K>> {
        match delta {
            Delta::Applied(obj) => {
                let Some(key) = meta_key(obj.meta()) else {
                    warn!("ignoring object without name");
                    return Vec::new();
                };
                let new = Arc::new(obj);
                match self.write().insert(key, Arc::clone(&new)) {
                    Some(old) => vec![Change::Updated { old, new }],
                    None => vec![Change::Added(new)],
                }
            }
            Delta::Deleted(obj) => {
                let removed = meta_key(obj.meta()).and_then(|key| self.write().remove(&key));
                match removed {
                    Some(_) => vec![Change::Removed(Arc::new(obj))],
                    None => Vec::new(),
                }
            }
            Delta::Relisted(objs) => {
                let mut next: FxHashMap<String, Arc<K>> = FxHashMap::default();
                for obj in objs {
                    if let Some(key) = meta_key(obj.meta()) { next.insert(key, Arc::new(obj)); }
                }
                let prev = std::mem::replace(&mut *self.write(), next.clone());
                let mut out = Vec::with_capacity(next.len());
                for (key, new) in &next {
                    match prev.get(key) {
                        Some(old) => out.push(Change::Updated { old: Arc::clone(old), new: Arc::clone(new) }),
                        None => out.push(Change::Added(Arc::clone(new))),
                    }
                }
                for (key, old) in prev {
                    if !next.contains_key(&key) { out.push(Change::Removed(old)); }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap { metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), ..Default::default() }, ..Default::default() }
    }

    #[test]
    fn applied_then_deleted() {
        let c = Cache::new();
        assert!(matches!(c.apply(Delta::Applied(cm("a"))).as_slice(), [Change::Added(_)]));
        assert!(matches!(c.apply(Delta::Applied(cm("a"))).as_slice(), [Change::Updated { .. }]));
        assert!(c.get("ns/a").is_some());
        assert!(matches!(c.apply(Delta::Deleted(cm("a"))).as_slice(), [Change::Removed(_)]));
        assert!(c.is_empty());
    }

    #[test]
    fn deleting_unknown_key_changes_nothing() {
        let c = Cache::new();
        c.apply(Delta::Applied(cm("a")));
        assert!(c.apply(Delta::Deleted(cm("b"))).is_empty());
        assert_eq!(c.len(), 1);
        c.apply(Delta::Deleted(cm("a")));
        assert!(c.apply(Delta::Deleted(cm("a"))).is_empty());
    }

    #[test]
    fn relist_diffs_against_contents() {
        let c = Cache::new();
        c.apply(Delta::Relisted(vec![cm("a"), cm("b")]));
        let changes = c.apply(Delta::Relisted(vec![cm("b"), cm("c")]));
        let mut summary: Vec<String> = changes
            .iter()
            .map(|ch| match ch {
                Change::Added(o) => format!("add {}", o.metadata.name.as_deref().unwrap_or("")),
                Change::Updated { new, .. } => format!("update {}", new.metadata.name.as_deref().unwrap_or("")),
                Change::Removed(o) => format!("remove {}", o.metadata.name.as_deref().unwrap_or("")),
            })
            .collect();
        summary.sort();
        assert_eq!(summary, vec!["add c", "remove a", "update b"]);
        assert_eq!(c.len(), 2);
    }
}
