//! Maps owned objects back to the Memcached that controls them.

use rustc_hash::{FxHashMap, FxHashSet};
use tender_core::{ObjectKey, OwnerRef, ResourceKind, GROUP};

/// Identity of an owned object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnedId {
    pub kind: ResourceKind,
    pub key: ObjectKey,
}

/// Index of owned object -> owner key, fed from the owner references seen on watch events.
#[derive(Debug, Default)]
pub struct OwnershipIndex {
    owners: FxHashMap<OwnedId, ObjectKey>,
}

impl OwnershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the Memcached owning an object in `namespace` from its owner references.
    ///
    /// The controller reference wins. Without one, exactly one Memcached reference must
    /// exist; anything else is not ours and yields `None`.
    pub fn owner_from_refs(namespace: &str, refs: &[OwnerRef]) -> Option<ObjectKey> {
        let ours: Vec<&OwnerRef> = refs.iter().filter(|r| is_memcached_ref(r)).collect();
        let chosen = match ours.iter().find(|r| r.controller) {
            Some(r) => *r,
            None => match ours.as_slice() {
                [only] => *only,
                _ => return None,
            },
        };
        Some(ObjectKey::new(namespace, chosen.name.clone()))
    }

    /// Record the owner of an object from its current references. A reference that
    /// disappeared also drops the index entry.
    pub fn observe(&mut self, kind: ResourceKind, key: &ObjectKey, refs: &[OwnerRef]) -> Option<ObjectKey> {
        let id = OwnedId { kind, key: key.clone() };
        match Self::owner_from_refs(&key.namespace, refs) {
            Some(owner) => {
                self.owners.insert(id, owner.clone());
                Some(owner)
            }
            None => {
                self.owners.remove(&id);
                None
            }
        }
    }

    /// Drop an object from the index, returning the owner it was last seen with.
    pub fn forget(&mut self, kind: ResourceKind, key: &ObjectKey) -> Option<ObjectKey> {
        self.owners.remove(&OwnedId { kind, key: key.clone() })
    }

    /// Drop every entry of `kind` in scope that a relist no longer contains, returning the
    /// owners of the dropped entries. `namespace` limits the scope; `None` covers all namespaces.
    pub fn retain_listed(&mut self, kind: ResourceKind, namespace: Option<&str>, present: &[ObjectKey]) -> Vec<ObjectKey> {
        let present: FxHashSet<&ObjectKey> = present.iter().collect();
        let mut orphaned = Vec::new();
        self.owners.retain(|id, owner| {
            let in_scope = id.kind == kind && namespace.map_or(true, |ns| id.key.namespace == ns);
            if in_scope && !present.contains(&id.key) {
                orphaned.push(owner.clone());
                return false;
            }
            true
        });
        orphaned.sort();
        orphaned.dedup();
        orphaned
    }

    pub fn owner_of(&self, kind: ResourceKind, key: &ObjectKey) -> Option<&ObjectKey> {
        self.owners.get(&OwnedId { kind, key: key.clone() })
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

fn is_memcached_ref(r: &OwnerRef) -> bool {
    let group = r.api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
    r.kind == ResourceKind::Memcached.as_str() && group == GROUP && !r.name.is_empty() && !r.uid.is_empty()
}
