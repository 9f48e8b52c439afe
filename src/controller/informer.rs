//! Watch events to changes.
//!
//! `kube` watchers report the current object only. [`LastSeen`] keeps the
//! previous version of every object so updates carry both snapshots, and
//! reconciles relists after a watch restart so objects deleted while the
//! watch was down still produce a delete.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};

use crate::controller::queue::ChangeOp;

/// Operation plus snapshots, before validation by `Change::from_parts`.
#[derive(Debug)]
pub struct RawChange<K> {
    pub op: ChangeOp,
    pub old: Option<Arc<K>>,
    pub new: Option<Arc<K>>,
}

impl<K> RawChange<K> {
    fn add(new: Arc<K>) -> Self {
        Self {
            op: ChangeOp::Add,
            old: None,
            new: Some(new),
        }
    }

    fn update(old: Arc<K>, new: Arc<K>) -> Self {
        Self {
            op: ChangeOp::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    fn delete(old: Arc<K>) -> Self {
        Self {
            op: ChangeOp::Delete,
            old: Some(old),
            new: None,
        }
    }
}

type ObjectKey = (String, String);

/// Last observed version of every object of one kind.
pub struct LastSeen<K> {
    seen: HashMap<ObjectKey, Arc<K>>,
    /// Objects with a deletion timestamp whose delete was already emitted.
    deleting: HashSet<ObjectKey>,
    /// Keys listed since the last `Init`, while a relist is running.
    relisted: Option<HashSet<ObjectKey>>,
}

impl<K> Default for LastSeen<K> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            deleting: HashSet::new(),
            relisted: None,
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> ObjectKey {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K: Resource> LastSeen<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Fold one watch event into the cache and return the resulting changes.
    pub fn observe(&mut self, event: Event<K>) -> Vec<RawChange<K>> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(object_key(&obj));
                }
                self.apply(obj).into_iter().collect()
            }
            Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let stale: Vec<ObjectKey> = self
                    .seen
                    .keys()
                    .filter(|k| !relisted.contains(*k))
                    .cloned()
                    .collect();
                stale
                    .into_iter()
                    .filter_map(|key| {
                        let old = self.seen.remove(&key)?;
                        if self.deleting.remove(&key) {
                            None
                        } else {
                            Some(RawChange::delete(old))
                        }
                    })
                    .collect()
            }
            Event::Apply(obj) => self.apply(obj).into_iter().collect(),
            Event::Delete(obj) => self.delete(obj).into_iter().collect(),
        }
    }

    fn apply(&mut self, obj: K) -> Option<RawChange<K>> {
        let key = object_key(&obj);
        let obj = Arc::new(obj);
        let previous = self.seen.insert(key.clone(), obj.clone());

        if obj.meta().deletion_timestamp.is_some() {
            return if self.deleting.insert(key) {
                Some(RawChange::delete(obj))
            } else {
                None
            };
        }

        match previous {
            Some(previous) if previous.resource_version() == obj.resource_version() => None,
            Some(previous) => Some(RawChange::update(previous, obj)),
            None => Some(RawChange::add(obj)),
        }
    }

    fn delete(&mut self, obj: K) -> Option<RawChange<K>> {
        let key = object_key(&obj);
        self.seen.remove(&key);
        if self.deleting.remove(&key) {
            None
        } else {
            Some(RawChange::delete(Arc::new(obj)))
        }
    }
}
