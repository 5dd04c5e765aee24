//! Bidirectional owner ↔ target index (routes → secrets they reference).

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

type Targets = SmallVec<[String; 4]>;

#[derive(Default)]
struct Maps {
    forward: FxHashMap<String, Targets>,
    inverse: FxHashMap<String, FxHashSet<String>>,
}

impl Maps {
    fn unlink(&mut self, owner: &str) {
        let Some(targets) = self.forward.remove(owner) else { return };
        for t in targets {
            if let Some(owners) = self.inverse.get_mut(&t) {
                owners.remove(owner);
                if owners.is_empty() { self.inverse.remove(&t); }
            }
        }
    }
}

/// Many-to-many reference map. The inverse side is always the exact transpose of the forward side.
#[derive(Default)]
pub struct ObjectRefMap {
    maps: RwLock<Maps>,
}

impl ObjectRefMap {
    pub fn new() -> Self { Self::default() }

    fn read(&self) -> RwLockReadGuard<'_, Maps> { self.maps.read().unwrap_or_else(|e| e.into_inner()) }
    fn write(&self) -> RwLockWriteGuard<'_, Maps> { self.maps.write().unwrap_or_else(|e| e.into_inner()) }

    /// Replace `owner`'s whole target set. An empty set removes the owner.
    pub fn insert<I, S>(&self, owner: &str, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Targets = SmallVec::new();
        for t in targets {
            let t = t.into();
            if !set.contains(&t) { set.push(t); }
        }
        let mut m = self.write();
        m.unlink(owner);
        if set.is_empty() { return; }
        for t in &set {
            m.inverse.entry(t.clone()).or_default().insert(owner.to_string());
        }
        m.forward.insert(owner.to_string(), set);
    }

    pub fn delete(&self, owner: &str) { self.write().unlink(owner); }

    /// Owners referencing `target`, sorted.
    pub fn reference(&self, target: &str) -> Vec<String> {
        let mut out: Vec<String> = self.read().inverse.get(target).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    /// Targets referenced by `owner`, sorted.
    pub fn referenced_by(&self, owner: &str) -> Vec<String> {
        let mut out: Vec<String> = self.read().forward.get(owner).map(|s| s.to_vec()).unwrap_or_default();
        out.sort();
        out
    }

    pub fn has_owner(&self, owner: &str) -> bool { self.read().forward.contains_key(owner) }

    /// Number of owners with at least one target.
    pub fn len(&self) -> usize { self.read().forward.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
