//! Columnar attribute codec
//!
//! # Layout
//!
//! ```text
//! snapshot0_rows          growable record dimension
//! snapshot0_n_atoms = 5   one fixed dimension per descriptor dimension
//! snapshot0_coordinates   [snapshot0_rows, snapshot0_n_atoms, snapshot0_n_spatial]
//! snapshot0_velocities    [snapshot0_rows, snapshot0_n_atoms, snapshot0_n_spatial]
//! ```
//!
//! Row `slot / 2` always holds the forward state of a pair. Writing to an
//! odd slot stores the reversal of the given snapshot; reading an odd slot
//! decodes the forward state and reverses it.

use super::cache::WeakLruCache;
use super::chunk_cache::ChunkCache;
use super::column;
use super::file::{ArrayFile, VarType, VariableSpec};
use super::slot::Slot;
use crate::error::{Error, Result};
use crate::snapshot::{check_value, Snapshot, SnapshotDescriptor, SnapshotId};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Column {
    variable: String,
    var_type: VarType,
    shape: Vec<usize>,
}

/// Reads and writes one snapshot type
#[derive(Debug)]
pub struct SnapshotCodec {
    prefix: String,
    descriptor: Arc<SnapshotDescriptor>,
    chunk_rows: usize,
    columns: Vec<Column>,
    reads: u64,
    derived: u64,
}

impl SnapshotCodec {
    pub fn new(prefix: &str, descriptor: Arc<SnapshotDescriptor>, chunk_rows: usize) -> Result<Self> {
        descriptor.validate()?;
        let columns = descriptor
            .fields()
            .iter()
            .map(|field| {
                Ok(Column {
                    variable: format!("{}_{}", prefix, field.name),
                    var_type: field.var_type,
                    shape: descriptor.shape(field)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            prefix: prefix.to_string(),
            descriptor,
            chunk_rows,
            columns,
            reads: 0,
            derived: 0,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn descriptor(&self) -> &Arc<SnapshotDescriptor> {
        &self.descriptor
    }

    pub fn record_dimension(&self) -> String {
        format!("{}_rows", self.prefix)
    }

    /// Register dimensions and columns; attaches to them if they exist
    pub fn initialize(&self, file: &mut dyn ArrayFile) -> Result<()> {
        let record = self.record_dimension();
        file.create_dimension(&record, None)?;
        for (name, size) in self.descriptor.dimensions() {
            file.create_dimension(&format!("{}_{}", self.prefix, name), Some(*size))?;
        }

        for field in self.descriptor.fields() {
            let mut dimensions = vec![record.clone()];
            dimensions.extend(
                field
                    .dimensions
                    .iter()
                    .map(|d| format!("{}_{}", self.prefix, d)),
            );
            file.create_variable(
                VariableSpec::new(
                    &format!("{}_{}", self.prefix, field.name),
                    field.var_type,
                    dimensions,
                )
                .with_chunk_rows(self.chunk_rows)
                .with_description(&format!("{}.{}", self.descriptor.class(), field.name)),
            )?;
        }

        debug!(prefix = %self.prefix, class = self.descriptor.class(), "Initialized codec");
        Ok(())
    }

    /// Encode `snapshot` into the row of `slot`
    ///
    /// Every field is encoded before the first write, so a type error
    /// leaves the file untouched.
    pub fn write(
        &self,
        file: &mut dyn ArrayFile,
        chunks: &mut ChunkCache,
        slot: Slot,
        snapshot: &Snapshot,
    ) -> Result<()> {
        if **snapshot.descriptor() != *self.descriptor {
            return Err(Error::TypeMismatch(format!(
                "Codec {} stores {}, got {}",
                self.prefix,
                self.descriptor,
                snapshot.descriptor()
            )));
        }

        let reversed;
        let forward = if slot.is_reversed() {
            reversed = snapshot.reversed();
            &reversed
        } else {
            snapshot
        };

        let rows = self
            .columns
            .iter()
            .zip(self.descriptor.fields())
            .zip(forward.values())
            .map(|((col, field), value)| {
                check_value(&self.descriptor, field, value)?;
                column::encode(col.var_type, value)
            })
            .collect::<Result<Vec<_>>>()?;

        let row = slot.row() as usize;
        for (col, data) in self.columns.iter().zip(rows.iter()) {
            chunks.write_row(file, &col.variable, row, data)?;
        }
        trace!(prefix = %self.prefix, %slot, "Wrote snapshot row");
        Ok(())
    }

    /// Materialize the snapshot stored at `slot`
    ///
    /// `forward_id` is the identity recorded for the row. If the sibling
    /// slot is resident in `objects` the result is derived from it without
    /// touching the file.
    pub fn read(
        &mut self,
        file: &mut dyn ArrayFile,
        chunks: &mut ChunkCache,
        objects: &WeakLruCache<Slot, Snapshot>,
        slot: Slot,
        forward_id: SnapshotId,
    ) -> Result<Snapshot> {
        if let Some(sibling) = objects.peek(&slot.sibling()) {
            self.derived += 1;
            trace!(%slot, "Derived from cached sibling");
            return Ok(sibling.reversed());
        }

        let row = slot.row() as usize;
        let values = self
            .columns
            .iter()
            .map(|col| {
                let data = chunks.read_row(file, &col.variable, row)?;
                column::decode(col.var_type, &col.shape, &data)
            })
            .collect::<Result<Vec<_>>>()?;
        self.reads += 1;

        let forward = Snapshot::from_parts(forward_id, Arc::clone(&self.descriptor), values);
        Ok(if slot.is_reversed() {
            forward.reversed()
        } else {
            forward
        })
    }

    /// Number of reads that decoded from the file
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Number of reads served by reversing a cached sibling
    pub fn derived(&self) -> u64 {
        self.derived
    }
}
