//! Lazy snapshot references
//!
//! A `LoaderProxy` names a stored snapshot by (store, slot, identity) and
//! loads it on first use. Clones share the loaded object. Equality and
//! hashing only look at the identity, so a proxy and the snapshot it
//! resolves to are interchangeable as map keys.

use super::file::ArrayFile;
use super::slot::Slot;
use super::store::SnapshotStorage;
use crate::error::{Error, Result};
use crate::snapshot::{Snapshot, SnapshotId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

#[derive(Clone)]
pub struct LoaderProxy {
    store: Uuid,
    slot: Slot,
    id: SnapshotId,
    loaded: Arc<OnceLock<Arc<Snapshot>>>,
}

impl LoaderProxy {
    pub(crate) fn new(store: Uuid, slot: Slot, id: SnapshotId) -> Self {
        Self {
            store,
            slot,
            id,
            loaded: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Instance id of the store this proxy belongs to
    pub fn store(&self) -> Uuid {
        self.store
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// The snapshot, if an earlier `resolve` loaded it
    pub fn loaded(&self) -> Option<Arc<Snapshot>> {
        self.loaded.get().cloned()
    }

    /// Load the snapshot, or return it if an earlier call already did
    pub fn resolve<F: ArrayFile>(&self, storage: &mut SnapshotStorage<F>) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.loaded.get() {
            return Ok(Arc::clone(snapshot));
        }
        if storage.store_id() != self.store {
            return Err(Error::InvalidArgument(format!(
                "Proxy for {} belongs to store {}, not {}",
                self.id,
                self.store,
                storage.store_id()
            )));
        }

        let snapshot = storage.load(self.slot)?;
        if snapshot.id() != self.id {
            return Err(Error::ConsistencyViolation(format!(
                "{} holds {}, proxy expected {}",
                self.slot,
                snapshot.id(),
                self.id
            )));
        }
        Ok(Arc::clone(self.loaded.get_or_init(|| snapshot)))
    }
}

impl fmt::Debug for LoaderProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderProxy")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl PartialEq for LoaderProxy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LoaderProxy {}

impl Hash for LoaderProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A snapshot that is either in memory or still on disk
#[derive(Debug, Clone)]
pub enum SnapshotRef {
    Resolved(Arc<Snapshot>),
    Unresolved(LoaderProxy),
}

impl SnapshotRef {
    pub fn id(&self) -> SnapshotId {
        match self {
            SnapshotRef::Resolved(snapshot) => snapshot.id(),
            SnapshotRef::Unresolved(proxy) => proxy.id(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            SnapshotRef::Resolved(_) => true,
            SnapshotRef::Unresolved(proxy) => proxy.is_loaded(),
        }
    }

    pub fn resolve<F: ArrayFile>(&self, storage: &mut SnapshotStorage<F>) -> Result<Arc<Snapshot>> {
        match self {
            SnapshotRef::Resolved(snapshot) => Ok(Arc::clone(snapshot)),
            SnapshotRef::Unresolved(proxy) => proxy.resolve(storage),
        }
    }
}

impl From<Arc<Snapshot>> for SnapshotRef {
    fn from(snapshot: Arc<Snapshot>) -> Self {
        SnapshotRef::Resolved(snapshot)
    }
}

impl From<Snapshot> for SnapshotRef {
    fn from(snapshot: Snapshot) -> Self {
        SnapshotRef::Resolved(Arc::new(snapshot))
    }
}

impl From<LoaderProxy> for SnapshotRef {
    fn from(proxy: LoaderProxy) -> Self {
        SnapshotRef::Unresolved(proxy)
    }
}

impl PartialEq for SnapshotRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for SnapshotRef {}

impl Hash for SnapshotRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}
