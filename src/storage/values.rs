//! Derived value caches
//!
//! # Architecture
//!
//! ```text
//! DerivedValueStore "distance" (snapshots_cv0)
//!   ├─→ snapshots_cv0_value [.._rows, .._d0, ...]   computed values, append-only
//!   ├─→ snapshots_cv0_index [.._rows]               key slot of each value row
//!   └─→ volatile                            values for unsaved snapshots
//! ```
//!
//! Each computation gets its own store. Values of stored snapshots are
//! persisted and keyed by slot; a time-reversible computation keys both
//! members of a pair by the forward slot, so the pair shares one entry.
//! The record describing the store lives in the store's `cvcache` reference table
//! and is restored on reopen without its computation; `add_cv` re-attaches it.

use super::chunk_cache::ChunkCache;
use super::column;
use super::file::{ArrayFile, VarType, VariableSpec};
use super::slot::Slot;
use crate::error::{Error, Result};
use crate::snapshot::{Snapshot, SnapshotId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A function of a snapshot whose results are worth keeping
pub trait Computation: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the value is unchanged by time reversal
    fn time_reversible(&self) -> bool {
        true
    }

    fn evaluate(&self, snapshot: &Snapshot) -> Result<Value>;
}

/// Computation backed by a closure
pub struct FnComputation<F> {
    name: String,
    time_reversible: bool,
    function: F,
}

impl<F> FnComputation<F>
where
    F: Fn(&Snapshot) -> Result<Value> + Send + Sync,
{
    pub fn new(name: &str, time_reversible: bool, function: F) -> Self {
        Self {
            name: name.to_string(),
            time_reversible,
            function,
        }
    }
}

impl<F> Computation for FnComputation<F>
where
    F: Fn(&Snapshot) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn time_reversible(&self) -> bool {
        self.time_reversible
    }

    fn evaluate(&self, snapshot: &Snapshot) -> Result<Value> {
        (self.function)(snapshot)
    }
}

/// Handle returned by `add_cv`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CvHandle(pub(crate) usize);

impl CvHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cv{}", self.0)
    }
}

/// Persisted description of a derived value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CvRecord {
    pub name: String,
    pub time_reversible: bool,
    pub var_type: VarType,
    pub shape: Vec<usize>,
}

pub struct DerivedValueStore {
    prefix: String,
    record: CvRecord,
    computation: Option<Arc<dyn Computation>>,
    /// key slot → value row
    rows: HashMap<u64, usize>,
    volatile: HashMap<SnapshotId, Value>,
    evaluations: u64,
}

impl DerivedValueStore {
    /// Create a store for `computation`, sizing its columns from `sample`
    pub fn create(
        file: &mut dyn ArrayFile,
        prefix: &str,
        computation: Arc<dyn Computation>,
        sample: &Snapshot,
        chunk_rows: usize,
    ) -> Result<Self> {
        let value = computation.evaluate(sample)?;
        let var_type = match value {
            Value::Float(_) => VarType::Float64,
            Value::Int(_) => VarType::Int64,
            Value::Bool(_) => VarType::Bool,
        };
        let record = CvRecord {
            name: computation.name().to_string(),
            time_reversible: computation.time_reversible(),
            var_type,
            shape: value.shape().to_vec(),
        };

        let mut store = Self::restore(file, prefix, record, chunk_rows)?;
        store.computation = Some(computation);
        store.evaluations = 1;
        let key = store.key_id(sample.id());
        store.volatile.insert(key, value);
        info!(name = %store.record.name, prefix, "Created derived value store");
        Ok(store)
    }

    /// Attach to the columns of a persisted record
    pub fn restore(
        file: &mut dyn ArrayFile,
        prefix: &str,
        record: CvRecord,
        chunk_rows: usize,
    ) -> Result<Self> {
        let record_dim = format!("{}_rows", prefix);
        file.create_dimension(&record_dim, None)?;
        let mut dimensions = vec![record_dim.clone()];
        for (i, size) in record.shape.iter().enumerate() {
            let name = format!("{}_d{}", prefix, i);
            file.create_dimension(&name, Some(*size))?;
            dimensions.push(name);
        }

        let value_var = format!("{}_value", prefix);
        let index_var = format!("{}_index", prefix);
        file.create_variable(
            VariableSpec::new(&value_var, record.var_type, dimensions)
                .with_chunk_rows(chunk_rows)
                .with_description(&record.name),
        )?;
        file.create_variable(
            VariableSpec::new(&index_var, VarType::Int64, vec![record_dim])
                .with_chunk_rows(chunk_rows),
        )?;

        let count = file.row_count(&index_var)?;
        let data = file.read_rows(&index_var, 0, count)?;
        let mut rows = HashMap::with_capacity(count);
        for (row, chunk) in data.chunks_exact(8).enumerate() {
            let key = column::decode_index(chunk)?;
            if key >= 0 {
                rows.insert(key as u64, row);
            }
        }

        debug!(name = %record.name, values = rows.len(), "Attached derived value store");
        Ok(Self {
            prefix: prefix.to_string(),
            record,
            computation: None,
            rows,
            volatile: HashMap::new(),
            evaluations: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &CvRecord {
        &self.record
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn has_computation(&self) -> bool {
        self.computation.is_some()
    }

    /// Re-attach the computation of a restored store
    pub fn attach(&mut self, computation: Arc<dyn Computation>) -> Result<()> {
        if computation.time_reversible() != self.record.time_reversible {
            return Err(Error::InvalidArgument(format!(
                "Computation '{}' disagrees with its stored time reversibility",
                self.record.name
            )));
        }
        self.computation = Some(computation);
        Ok(())
    }

    /// Number of values persisted
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// How many times the computation ran
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    fn key_id(&self, id: SnapshotId) -> SnapshotId {
        if self.record.time_reversible {
            id.canonical()
        } else {
            id
        }
    }

    fn key_slot(&self, slot: Slot) -> Slot {
        if self.record.time_reversible {
            slot.forward()
        } else {
            slot
        }
    }

    /// Value for `snapshot`, stored at `slot` if it is stored at all
    pub fn value(
        &mut self,
        file: &mut dyn ArrayFile,
        chunks: &mut ChunkCache,
        snapshot: &Snapshot,
        slot: Option<Slot>,
    ) -> Result<Value> {
        let key_id = self.key_id(snapshot.id());
        let Some(slot) = slot else {
            if let Some(value) = self.volatile.get(&key_id) {
                return Ok(value.clone());
            }
            let value = self.evaluate(snapshot)?;
            self.volatile.insert(key_id, value.clone());
            return Ok(value);
        };

        let key = self.key_slot(slot);
        if let Some(row) = self.rows.get(&key.value()) {
            let data = chunks.read_row(file, &format!("{}_value", self.prefix), *row)?;
            return column::decode(self.record.var_type, &self.record.shape, &data);
        }

        // Computed before the snapshot was saved
        let value = match self.volatile.remove(&key_id) {
            Some(value) => value,
            None => self.evaluate(snapshot)?,
        };
        self.persist(file, chunks, key, &value)?;
        Ok(value)
    }

    fn evaluate(&mut self, snapshot: &Snapshot) -> Result<Value> {
        let computation = self.computation.as_ref().ok_or_else(|| {
            Error::NotFound(format!(
                "Computation '{}' is not attached; call add_cv to restore it",
                self.record.name
            ))
        })?;
        let value = computation.evaluate(snapshot)?;
        if !value.fits(self.record.var_type) || value.shape() != self.record.shape.as_slice() {
            return Err(Error::TypeMismatch(format!(
                "Computation '{}' returned {} {:?}, expected {:?} {:?}",
                self.record.name,
                value.kind(),
                value.shape(),
                self.record.var_type,
                self.record.shape
            )));
        }
        self.evaluations += 1;
        Ok(value)
    }

    fn persist(
        &mut self,
        file: &mut dyn ArrayFile,
        chunks: &mut ChunkCache,
        key: Slot,
        value: &Value,
    ) -> Result<()> {
        let data = column::encode(self.record.var_type, value)?;
        let index_var = format!("{}_index", self.prefix);
        let row = file.row_count(&index_var)?;

        chunks.write_row(file, &format!("{}_value", self.prefix), row, &data)?;
        chunks.write_row(file, &index_var, row, &column::encode_index(key.value() as i64))?;
        self.rows.insert(key.value(), row);
        debug!(name = %self.record.name, %key, row, "Stored derived value");
        Ok(())
    }
}

impl fmt::Debug for DerivedValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedValueStore")
            .field("prefix", &self.prefix)
            .field("record", &self.record)
            .field("attached", &self.has_computation())
            .field("values", &self.rows.len())
            .finish()
    }
}
