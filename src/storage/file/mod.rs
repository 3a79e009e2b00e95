//! Backing array files
//!
//! The store talks to its backing file through the `ArrayFile` trait: a
//! netCDF-style container of named dimensions, typed variables laid out as
//! fixed-width rows along a growable record dimension, and reference
//! tables holding opaque JSON records that describe other stores.
//!
//! ```text
//! dimensions: snapshots_rows (growable), snapshot0_n_atoms = 3, ...
//! variables:  snapshot0_velocities [snapshot0_rows, snapshot0_n_atoms, snapshot0_n_spatial] f64
//! references: stores = ["snapshots"], snapshots_snapshottype[0] = {descriptor...}
//! ```
//!
//! Two drivers ship with the crate: `MemoryArrayFile` and
//! `DirectoryArrayFile` (one file per variable plus a JSON manifest).

pub mod directory;
pub mod memory;

pub use directory::DirectoryArrayFile;
pub use memory::MemoryArrayFile;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Float32,
    Float64,
    Int32,
    Int64,
    Bool,
    Uuid,
}

impl VarType {
    /// Bytes per element
    pub fn element_size(self) -> usize {
        match self {
            VarType::Bool => 1,
            VarType::Float32 | VarType::Int32 => 4,
            VarType::Float64 | VarType::Int64 => 8,
            VarType::Uuid => 16,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            VarType::Float32 | VarType::Float64 | VarType::Int32 | VarType::Int64
        )
    }
}

/// A named dimension; `size == None` marks the growable record dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub size: Option<usize>,
}

/// Declaration of a variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub var_type: VarType,
    /// Record dimension first, then fixed dimensions
    pub dimensions: Vec<String>,
    /// Rows per chunk, the unit of the chunk cache
    pub chunk_rows: usize,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableSpec {
    pub fn new(name: &str, var_type: VarType, dimensions: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            var_type,
            dimensions,
            chunk_rows: 100,
            description: None,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// I/O counters kept by every driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub rows_written: u64,
    pub rows_read: u64,
    pub read_calls: u64,
}

/// Capabilities the store needs from its backing file
///
/// Drivers are not reentrant; the store serializes all calls.
pub trait ArrayFile {
    /// Create a dimension; re-creating with the same size is a no-op
    fn create_dimension(&mut self, name: &str, size: Option<usize>) -> Result<()>;

    fn dimension(&self, name: &str) -> Option<&Dimension>;

    /// Create a variable; re-creating with an identical spec is a no-op
    fn create_variable(&mut self, spec: VariableSpec) -> Result<()>;

    fn variable(&self, name: &str) -> Option<&VariableSpec>;

    /// Width of one row in bytes
    fn row_bytes(&self, name: &str) -> Result<usize>;

    /// Number of rows along the record dimension
    fn row_count(&self, name: &str) -> Result<usize>;

    /// Read up to `count` rows starting at `start`, clipped at the row count
    fn read_rows(&mut self, name: &str, start: usize, count: usize) -> Result<Vec<u8>>;

    /// Write one row; rows past the end grow the variable, gaps read as zeros
    fn write_row(&mut self, name: &str, row: usize, data: &[u8]) -> Result<()>;

    /// Store an opaque record at `position` of a reference table
    fn set_reference(
        &mut self,
        table: &str,
        position: usize,
        reference: serde_json::Value,
    ) -> Result<()>;

    fn references(&self, table: &str) -> Vec<serde_json::Value>;

    /// Flush everything to durable storage
    fn sync(&mut self) -> Result<()>;

    fn stats(&self) -> FileStats;
}

/// Number of elements in one row of `spec`, checked against the dimensions
pub(crate) fn row_elements(
    dimensions: &BTreeMap<String, Dimension>,
    spec: &VariableSpec,
) -> Result<usize> {
    check_name(&spec.name)?;
    let (record, fixed) = spec.dimensions.split_first().ok_or_else(|| {
        Error::Storage(format!("Variable '{}' has no record dimension", spec.name))
    })?;

    match dimensions.get(record) {
        Some(Dimension { size: None, .. }) => {}
        Some(_) => {
            return Err(Error::Storage(format!(
                "Variable '{}': first dimension '{}' is not growable",
                spec.name, record
            )))
        }
        None => {
            return Err(Error::Storage(format!(
                "Variable '{}': unknown dimension '{}'",
                spec.name, record
            )))
        }
    }

    let mut elements = 1usize;
    for name in fixed {
        let size = dimensions
            .get(name)
            .ok_or_else(|| {
                Error::Storage(format!("Variable '{}': unknown dimension '{}'", spec.name, name))
            })?
            .size
            .ok_or_else(|| {
                Error::Storage(format!(
                    "Variable '{}': dimension '{}' must have a fixed size",
                    spec.name, name
                ))
            })?;
        elements *= size;
    }

    if elements == 0 {
        return Err(Error::Storage(format!(
            "Variable '{}' has zero-width rows",
            spec.name
        )));
    }
    Ok(elements)
}

/// Variable and dimension names double as file names
pub(crate) fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("Invalid name '{}'", name)))
    }
}

pub(crate) fn check_dimension(
    dimensions: &BTreeMap<String, Dimension>,
    name: &str,
    size: Option<usize>,
) -> Result<bool> {
    check_name(name)?;
    match dimensions.get(name) {
        Some(existing) if existing.size == size => Ok(false),
        Some(existing) => Err(Error::Storage(format!(
            "Dimension '{}' already exists with size {:?}",
            name, existing.size
        ))),
        None => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> BTreeMap<String, Dimension> {
        let mut dims = BTreeMap::new();
        for (name, size) in [("rows", None), ("atoms", Some(3)), ("spatial", Some(2))] {
            dims.insert(
                name.to_string(),
                Dimension {
                    name: name.to_string(),
                    size,
                },
            );
        }
        dims
    }

    #[test]
    fn test_row_elements() -> Result<()> {
        let spec = VariableSpec::new(
            "coords",
            VarType::Float64,
            vec!["rows".into(), "atoms".into(), "spatial".into()],
        );
        assert_eq!(row_elements(&dims(), &spec)?, 6);

        let scalar = VariableSpec::new("energy", VarType::Float32, vec!["rows".into()]);
        assert_eq!(row_elements(&dims(), &scalar)?, 1);
        Ok(())
    }

    #[test]
    fn test_row_elements_rejects_bad_layouts() {
        let fixed_first = VariableSpec::new("x", VarType::Int64, vec!["atoms".into()]);
        assert!(row_elements(&dims(), &fixed_first).is_err());

        let unknown = VariableSpec::new("x", VarType::Int64, vec!["rows".into(), "nope".into()]);
        assert!(row_elements(&dims(), &unknown).is_err());

        let bad_name = VariableSpec::new("../x", VarType::Int64, vec!["rows".into()]);
        assert!(matches!(
            row_elements(&dims(), &bad_name),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_element_sizes() {
        assert_eq!(VarType::Bool.element_size(), 1);
        assert_eq!(VarType::Float32.element_size(), 4);
        assert_eq!(VarType::Int64.element_size(), 8);
        assert_eq!(VarType::Uuid.element_size(), 16);
        assert!(!VarType::Uuid.is_numeric());
    }
}
