//! Type-dispatching snapshot store
//!
//! # Architecture
//!
//! ```text
//! SnapshotStorage
//!   ├─→ ReversalIndex    identity → slot, both directions
//!   ├─→ SlotAllocator    paired slots, reservations, rollback
//!   ├─→ codecs[n]        one SnapshotCodec per registered descriptor
//!   ├─→ WeakLruCache     slot → Arc<Snapshot>
//!   ├─→ ChunkCache       (column, chunk) → rows
//!   └─→ cvs[n]           one DerivedValueStore per computation
//! ```
//!
//! Wrapper columns, one row per slot pair:
//!
//! ```text
//! snapshots_uuid    forward identity of the row (nil = free row)
//! snapshots_store   index of the owning codec (-1 = reserved or ignored)
//! ```
//!
//! Everything else a store owns is named after its prefix too: codecs use
//! the prefix minus a trailing `s` plus their index (`snapshot0_*`), derived
//! values use `snapshots_cv{n}_*`, and the reference tables are
//! `snapshots_snapshottype` and `snapshots_cvcache`. Several stores can share
//! one file as long as their prefixes stay out of each other's way; the
//! file-wide `stores` table lists them.
//!
//! The uuid is written last, so a row only counts as used on reopen once
//! everything else in it has been written.

use super::allocator::SlotAllocator;
use super::cache::{CacheStats, WeakLruCache};
use super::chunk_cache::ChunkCache;
use super::codec::SnapshotCodec;
use super::column;
use super::file::{ArrayFile, FileStats, VarType, VariableSpec};
use super::index::ReversalIndex;
use super::proxy::{LoaderProxy, SnapshotRef};
use super::slot::{Slot, SlotState};
use super::values::{Computation, CvHandle, CvRecord, DerivedValueStore};
use crate::config::{MissingTypePolicy, StoreConfig};
use crate::error::{Error, Result};
use crate::snapshot::{Snapshot, SnapshotDescriptor, SnapshotId, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File-wide reference table listing the prefix of every store
pub const STORES_TABLE: &str = "stores";
/// Per-store reference table holding one descriptor per codec
pub const TYPE_TABLE: &str = "snapshottype";
/// Per-store reference table holding one record per derived value store
pub const CV_TABLE: &str = "cvcache";

const NO_STORE: i64 = -1;

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub saves: u64,
    pub dedup_hits: u64,
    pub attribute_writes: u64,
    pub codec_reads: u64,
    pub derived_reads: u64,
    pub types: usize,
    pub stored_pairs: usize,
    pub reserved_pairs: usize,
    pub high_water: u64,
    pub objects: CacheStats,
    pub chunks: CacheStats,
    pub file: FileStats,
}

/// Store for snapshots of any registered type
pub struct SnapshotStorage<F: ArrayFile> {
    file: F,
    config: StoreConfig,
    store_id: Uuid,
    index: ReversalIndex,
    allocator: SlotAllocator,
    codecs: Vec<SnapshotCodec>,
    /// row → owning codec, for written rows only
    owners: BTreeMap<u64, usize>,
    objects: WeakLruCache<Slot, Snapshot>,
    chunks: ChunkCache,
    cvs: Vec<DerivedValueStore>,
    saves: u64,
    dedup_hits: u64,
    attribute_writes: u64,
}

impl<F: ArrayFile> SnapshotStorage<F> {
    /// Create a new store in an empty file
    pub fn create(mut file: F, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if file.variable(&uuid_variable(&config)).is_some() {
            return Err(Error::InvalidArgument(format!(
                "File already holds a '{}' store; open it instead",
                config.prefix
            )));
        }
        let entries = file.references(STORES_TABLE);
        let position = entries.len();
        let stores: Vec<String> = entries
            .into_iter()
            .filter_map(|r| r.as_str().map(str::to_string))
            .collect();
        let base = namespace(&config.prefix);
        if let Some(other) = stores.iter().find(|other| {
            let other = namespace(other);
            other.starts_with(base) || base.starts_with(other)
        }) {
            return Err(Error::InvalidArgument(format!(
                "Prefix '{}' overlaps the '{}' store already in this file",
                config.prefix, other
            )));
        }

        let rows = format!("{}_rows", config.prefix);
        file.create_dimension(&rows, None)?;
        file.create_variable(
            VariableSpec::new(&uuid_variable(&config), VarType::Uuid, vec![rows.clone()])
                .with_chunk_rows(config.chunk_rows)
                .with_description("forward identity per row"),
        )?;
        file.create_variable(
            VariableSpec::new(&store_variable(&config), VarType::Int64, vec![rows])
                .with_chunk_rows(config.chunk_rows)
                .with_description("owning sub-store per row"),
        )?;
        file.set_reference(
            STORES_TABLE,
            position,
            serde_json::Value::String(config.prefix.clone()),
        )?;

        let storage = Self::empty(file, config);
        info!(store = %storage.store_id, prefix = %storage.config.prefix, "Created snapshot storage");
        Ok(storage)
    }

    /// Open a store previously created in `file`
    pub fn open(file: F, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let uuid_var = uuid_variable(&config);
        if file.variable(&uuid_var).is_none() {
            return Err(Error::NotFound(format!(
                "No '{}' store in this file",
                config.prefix
            )));
        }

        let mut storage = Self::empty(file, config);

        for (n, reference) in storage.file.references(&type_table(&storage.config)).into_iter().enumerate() {
            let descriptor: SnapshotDescriptor = serde_json::from_value(reference)?;
            let codec = SnapshotCodec::new(
                &storage.codec_prefix(n),
                Arc::new(descriptor),
                storage.config.chunk_rows,
            )?;
            codec.initialize(&mut storage.file)?;
            storage.codecs.push(codec);
        }

        for (n, reference) in storage.file.references(&cv_table(&storage.config)).into_iter().enumerate() {
            let record: CvRecord = serde_json::from_value(reference)?;
            let prefix = storage.cv_prefix(n);
            let cv = DerivedValueStore::restore(
                &mut storage.file,
                &prefix,
                record,
                storage.config.cv_chunk_rows,
            )?;
            storage.cvs.push(cv);
        }

        let rows = storage.file.row_count(&uuid_var)?;
        let ids = storage.file.read_rows(&uuid_var, 0, rows)?;
        let owners = storage
            .file
            .read_rows(&store_variable(&storage.config), 0, rows)?;

        let mut reserved = Vec::new();
        let mut free = Vec::new();
        for (row, data) in ids.chunks_exact(16).enumerate() {
            let slot = Slot::from_row(row as u64);
            let id = column::decode_uuid(data)?;
            if id == 0 {
                free.push(slot);
                continue;
            }
            storage.index.insert(SnapshotId::from_u128(id), slot)?;

            let owner = match owners.get(row * 8..row * 8 + 8) {
                Some(data) => column::decode_index(data)?,
                None => NO_STORE,
            };
            if owner == NO_STORE {
                reserved.push(slot);
            } else if owner >= 0 && (owner as usize) < storage.codecs.len() {
                storage.owners.insert(row as u64, owner as usize);
            } else {
                return Err(Error::ConsistencyViolation(format!(
                    "Row {} is owned by unknown sub-store {}",
                    row, owner
                )));
            }
        }
        storage.allocator = SlotAllocator::restore(rows as u64, reserved, free);

        info!(
            store = %storage.store_id,
            types = storage.codecs.len(),
            rows,
            written = storage.owners.len(),
            cvs = storage.cvs.len(),
            "Opened snapshot storage"
        );
        Ok(storage)
    }

    fn empty(file: F, config: StoreConfig) -> Self {
        Self {
            objects: WeakLruCache::new(config.object_cache_capacity),
            chunks: ChunkCache::new(config.chunk_cache_max_chunks),
            file,
            config,
            store_id: Uuid::new_v4(),
            index: ReversalIndex::new(),
            allocator: SlotAllocator::new(),
            codecs: Vec::new(),
            owners: BTreeMap::new(),
            cvs: Vec::new(),
            saves: 0,
            dedup_hits: 0,
            attribute_writes: 0,
        }
    }

    /// Flush and hand back the backing file
    pub fn close(mut self) -> Result<F> {
        self.file.sync()?;
        info!(store = %self.store_id, written = self.owners.len(), "Closed snapshot storage");
        Ok(self.file)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    /// Runtime id of this store instance
    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn file(&self) -> &F {
        &self.file
    }

    fn codec_prefix(&self, n: usize) -> String {
        format!("{}{}", namespace(&self.config.prefix), n)
    }

    fn cv_prefix(&self, n: usize) -> String {
        format!("{}_cv{}", self.config.prefix, n)
    }

    // ---- types ----

    /// Register a descriptor, returning its sub-store index
    pub fn add_type(&mut self, descriptor: Arc<SnapshotDescriptor>) -> Result<usize> {
        if let Some(n) = self.type_index(&descriptor) {
            return Ok(n);
        }

        let n = self.codecs.len();
        let codec = SnapshotCodec::new(&self.codec_prefix(n), descriptor, self.config.chunk_rows)?;
        let reference = serde_json::to_value(&**codec.descriptor())?;
        codec.initialize(&mut self.file)?;
        self.file.set_reference(&type_table(&self.config), n, reference)?;

        info!(store = n, descriptor = %codec.descriptor(), "Registered snapshot type");
        self.codecs.push(codec);
        Ok(n)
    }

    /// Register the template's type and store the template
    pub fn add_type_with_template(&mut self, template: &Arc<Snapshot>) -> Result<usize> {
        let n = self.add_type(Arc::clone(template.descriptor()))?;
        self.save(template)?;
        Ok(n)
    }

    pub fn type_index(&self, descriptor: &SnapshotDescriptor) -> Option<usize> {
        self.codecs
            .iter()
            .position(|c| **c.descriptor() == *descriptor)
    }

    /// Registered descriptors in sub-store order
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<SnapshotDescriptor>> + '_ {
        self.codecs.iter().map(|c| c.descriptor())
    }

    /// Find the codec for a descriptor, applying the missing-type policy
    fn resolve_type(&mut self, descriptor: &Arc<SnapshotDescriptor>) -> Result<Option<usize>> {
        if let Some(n) = self.type_index(descriptor) {
            return Ok(Some(n));
        }
        match self.config.missing_type_policy {
            MissingTypePolicy::Create => self.add_type(Arc::clone(descriptor)).map(Some),
            MissingTypePolicy::Ignore => {
                warn!(descriptor = %descriptor, "No sub-store for type, storing identity only");
                Ok(None)
            }
            MissingTypePolicy::Fail => Err(Error::MissingTypeSupport(format!(
                "No sub-store registered for {}",
                descriptor
            ))),
        }
    }

    // ---- saving ----

    /// Store a snapshot, returning its slot
    ///
    /// Saving an identity that is already stored (in either direction)
    /// returns the existing slot without touching the file or the object
    /// cache. Only the first write of a slot decides what `load` returns.
    pub fn save(&mut self, snapshot: &Arc<Snapshot>) -> Result<Slot> {
        self.saves += 1;
        let id = snapshot.id();

        if let Some(slot) = self.index.lookup(id) {
            return match self.allocator.state(slot) {
                SlotState::Written => {
                    self.dedup_hits += 1;
                    debug!(%id, %slot, "Already stored");
                    Ok(slot)
                }
                SlotState::Reserved => match self.resolve_type(snapshot.descriptor())? {
                    Some(codec) => {
                        self.write_slot(codec, slot, snapshot)?;
                        Ok(slot)
                    }
                    None => Ok(slot),
                },
                SlotState::Unallocated => Err(Error::ConsistencyViolation(format!(
                    "{} is indexed at unallocated {}",
                    id, slot
                ))),
            };
        }

        let codec = self.resolve_type(snapshot.descriptor())?;
        let slot = self.claim(id)?;
        let result = match codec {
            Some(codec) => self.write_slot(codec, slot, snapshot),
            None => self.write_reservation(slot, id),
        };
        if let Err(e) = result {
            warn!(%id, %slot, error = %e, "Save failed, releasing slot");
            self.allocator.release(slot)?;
            return Err(e);
        }
        Ok(slot)
    }

    /// Save whatever a reference points at
    ///
    /// Proxies of this store are already stored and return their slot. A
    /// proxy of another store is saved through its loaded snapshot.
    pub fn save_ref(&mut self, reference: &SnapshotRef) -> Result<Slot> {
        match reference {
            SnapshotRef::Resolved(snapshot) => self.save(snapshot),
            SnapshotRef::Unresolved(proxy) if proxy.store() == self.store_id => Ok(proxy.slot()),
            SnapshotRef::Unresolved(proxy) => match proxy.loaded() {
                Some(snapshot) => self.save(&snapshot),
                None => Err(Error::InvalidArgument(format!(
                    "Proxy for {} belongs to another store and is not loaded",
                    proxy.id()
                ))),
            },
        }
    }

    /// Register an identity without storing its attributes
    pub fn reserve(&mut self, snapshot: &Snapshot) -> Result<Slot> {
        let id = snapshot.id();
        if let Some(slot) = self.index.lookup(id) {
            return Ok(slot);
        }
        let slot = self.claim(id)?;
        if let Err(e) = self.write_reservation(slot, id) {
            self.allocator.release(slot)?;
            return Err(e);
        }
        Ok(slot)
    }

    /// Store a copy of `snapshot` under a fresh identity
    pub fn duplicate(&mut self, snapshot: &Snapshot) -> Result<Slot> {
        let id = if snapshot.id().is_reversed() {
            SnapshotId::new().reversed()
        } else {
            SnapshotId::new()
        };
        let copy = Snapshot::from_parts(
            id,
            Arc::clone(snapshot.descriptor()),
            snapshot.values().to_vec(),
        );
        self.save(&Arc::new(copy))
    }

    /// Allocate a pair and pick the member matching the identity's direction
    fn claim(&mut self, id: SnapshotId) -> Result<Slot> {
        let pair = self.allocator.allocate();
        let slot = if id.is_reversed() { pair.sibling() } else { pair };
        if let Err(e) = self.index.check_insert(id, slot) {
            self.allocator.release(pair)?;
            return Err(e);
        }
        Ok(slot)
    }

    fn write_slot(&mut self, codec: usize, slot: Slot, snapshot: &Arc<Snapshot>) -> Result<()> {
        let id = snapshot.id();
        self.index.check_insert(id, slot)?;

        self.codecs[codec].write(&mut self.file, &mut self.chunks, slot, snapshot)?;
        self.write_row_header(slot, id, codec as i64)?;

        self.index.insert(id, slot)?;
        self.allocator.commit(slot)?;
        self.owners.insert(slot.row(), codec);
        self.objects.insert(slot, Arc::clone(snapshot));
        self.attribute_writes += 1;
        debug!(%id, %slot, store = codec, "Stored snapshot");
        Ok(())
    }

    fn write_reservation(&mut self, slot: Slot, id: SnapshotId) -> Result<()> {
        self.write_row_header(slot, id, NO_STORE)?;
        self.index.insert(id, slot)?;
        debug!(%id, %slot, "Reserved slot");
        Ok(())
    }

    /// Owner first, identity last
    fn write_row_header(&mut self, slot: Slot, id: SnapshotId, owner: i64) -> Result<()> {
        let row = slot.row() as usize;
        let store_var = store_variable(&self.config);
        let uuid_var = uuid_variable(&self.config);
        self.chunks
            .write_row(&mut self.file, &store_var, row, &column::encode_index(owner))?;
        self.chunks.write_row(
            &mut self.file,
            &uuid_var,
            row,
            &column::encode_uuid(id.canonical().as_u128()),
        )
    }

    // ---- loading ----

    /// Materialize the snapshot at `slot`
    pub fn load(&mut self, slot: Slot) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.objects.get(&slot) {
            return Ok(snapshot);
        }

        let id = self
            .index
            .identity_at(slot)
            .ok_or_else(|| Error::NotFound(format!("Nothing stored at {}", slot)))?;
        let owner = match self.owners.get(&slot.row()) {
            Some(owner) => *owner,
            None => {
                return Err(Error::NotFound(format!(
                    "{} is reserved for {} but holds no attributes",
                    slot, id
                )))
            }
        };

        let snapshot = self.codecs[owner].read(
            &mut self.file,
            &mut self.chunks,
            &self.objects,
            slot,
            id.canonical(),
        )?;
        let snapshot = Arc::new(snapshot);
        self.objects.insert(slot, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn load_id(&mut self, id: SnapshotId) -> Result<Arc<Snapshot>> {
        let slot = self
            .index
            .lookup(id)
            .ok_or_else(|| Error::NotFound(format!("Snapshot {}", id)))?;
        self.load(slot)
    }

    pub fn slot_of(&self, snapshot: &Snapshot) -> Option<Slot> {
        self.index.lookup(snapshot.id())
    }

    pub fn slot_state(&self, slot: Slot) -> SlotState {
        self.allocator.state(slot)
    }

    /// Lazy reference to the snapshot at `slot`
    pub fn proxy(&self, slot: Slot) -> Result<LoaderProxy> {
        let id = self
            .index
            .identity_at(slot)
            .ok_or_else(|| Error::NotFound(format!("Nothing stored at {}", slot)))?;
        Ok(LoaderProxy::new(self.store_id, slot, id))
    }

    /// Proxies for every stored snapshot, both directions, in slot order
    pub fn all(&self) -> Vec<LoaderProxy> {
        self.owners
            .keys()
            .flat_map(|row| {
                let slot = Slot::from_row(*row);
                [slot, slot.sibling()]
            })
            .filter_map(|slot| self.proxy(slot).ok())
            .collect()
    }

    /// Number of stored snapshots, counting both directions
    pub fn len(&self) -> usize {
        self.owners.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Re-read every stored pair from the file and check it
    ///
    /// Returns the number of pairs checked.
    pub fn verify(&mut self) -> Result<usize> {
        self.clear_object_cache();
        let rows: Vec<u64> = self.owners.keys().copied().collect();
        for row in &rows {
            let forward = Slot::from_row(*row);
            let a = self.load(forward)?;
            self.clear_object_cache();
            let b = self.load(forward.sibling())?;
            self.clear_object_cache();

            if b.id() != a.id().reversed() || !b.same_state(&a.reversed()) {
                return Err(Error::ConsistencyViolation(format!(
                    "Pair at row {} does not reverse consistently",
                    row
                )));
            }
            if self.index.lookup(a.id().reversed()) != Some(forward.sibling()) {
                return Err(Error::ConsistencyViolation(format!(
                    "Index does not pair {} with {}",
                    a.id(),
                    forward.sibling()
                )));
            }
        }
        info!(pairs = rows.len(), "Verified snapshot storage");
        Ok(rows.len())
    }

    // ---- derived values ----

    /// Register a computation, or re-attach it to a restored store
    pub fn add_cv(
        &mut self,
        computation: Arc<dyn Computation>,
        sample: &Snapshot,
    ) -> Result<CvHandle> {
        if let Some(n) = self.cvs.iter().position(|cv| cv.name() == computation.name()) {
            if !self.cvs[n].has_computation() {
                self.cvs[n].attach(computation)?;
                info!(name = self.cvs[n].name(), "Re-attached computation");
            }
            return Ok(CvHandle(n));
        }

        let n = self.cvs.len();
        let prefix = self.cv_prefix(n);
        let cv = DerivedValueStore::create(
            &mut self.file,
            &prefix,
            computation,
            sample,
            self.config.cv_chunk_rows,
        )?;
        self.file
            .set_reference(&cv_table(&self.config), n, serde_json::to_value(cv.record())?)?;
        self.cvs.push(cv);
        Ok(CvHandle(n))
    }

    /// Value of a computation for `snapshot`, computed at most once per key
    pub fn cv_value(&mut self, handle: CvHandle, snapshot: &Arc<Snapshot>) -> Result<Value> {
        let slot = self
            .index
            .lookup(snapshot.id())
            .filter(|slot| self.allocator.state(*slot) != SlotState::Unallocated);
        let cv = self
            .cvs
            .get_mut(handle.0)
            .ok_or_else(|| Error::NotFound(format!("Derived value store {}", handle)))?;
        cv.value(&mut self.file, &mut self.chunks, snapshot, slot)
    }

    pub fn cv(&self, handle: CvHandle) -> Option<&DerivedValueStore> {
        self.cvs.get(handle.0)
    }

    pub fn cvs(&self) -> &[DerivedValueStore] {
        &self.cvs
    }

    // ---- caches ----

    pub fn clear_object_cache(&mut self) {
        self.objects.clear();
    }

    pub fn clear_chunk_cache(&mut self) {
        self.chunks.clear();
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            saves: self.saves,
            dedup_hits: self.dedup_hits,
            attribute_writes: self.attribute_writes,
            codec_reads: self.codecs.iter().map(|c| c.reads()).sum(),
            derived_reads: self.codecs.iter().map(|c| c.derived()).sum(),
            types: self.codecs.len(),
            stored_pairs: self.owners.len(),
            reserved_pairs: self.allocator.claimed_count(),
            high_water: self.allocator.high_water(),
            objects: self.objects.stats(),
            chunks: self.chunks.stats(),
            file: self.file.stats(),
        }
    }
}

fn uuid_variable(config: &StoreConfig) -> String {
    format!("{}_uuid", config.prefix)
}

fn store_variable(config: &StoreConfig) -> String {
    format!("{}_store", config.prefix)
}

fn type_table(config: &StoreConfig) -> String {
    format!("{}_{}", config.prefix, TYPE_TABLE)
}

fn cv_table(config: &StoreConfig) -> String {
    format!("{}_{}", config.prefix, CV_TABLE)
}

/// Leading part shared by every name a store with `prefix` creates
fn namespace(prefix: &str) -> &str {
    prefix.strip_suffix('s').unwrap_or(prefix)
}
