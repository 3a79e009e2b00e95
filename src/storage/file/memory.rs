//! In-memory array file
//!
//! Keeps everything in process memory. `SnapshotStorage::close` hands the
//! driver back, so a store can be closed and reopened from the same value.

use super::{check_dimension, row_elements, ArrayFile, Dimension, FileStats, VariableSpec};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct MemoryVariable {
    spec: VariableSpec,
    row_bytes: usize,
    data: Vec<u8>,
}

impl MemoryVariable {
    fn rows(&self) -> usize {
        self.data.len() / self.row_bytes
    }
}

/// Array file held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryArrayFile {
    dimensions: BTreeMap<String, Dimension>,
    variables: BTreeMap<String, MemoryVariable>,
    references: BTreeMap<String, Vec<serde_json::Value>>,
    stats: FileStats,
}

impl MemoryArrayFile {
    pub fn new() -> Self {
        Self::default()
    }

    fn var(&self, name: &str) -> Result<&MemoryVariable> {
        self.variables
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Variable '{}'", name)))
    }

    /// Total bytes held by all variables
    pub fn data_size(&self) -> usize {
        self.variables.values().map(|v| v.data.len()).sum()
    }
}

impl ArrayFile for MemoryArrayFile {
    fn create_dimension(&mut self, name: &str, size: Option<usize>) -> Result<()> {
        if check_dimension(&self.dimensions, name, size)? {
            self.dimensions.insert(
                name.to_string(),
                Dimension {
                    name: name.to_string(),
                    size,
                },
            );
        }
        Ok(())
    }

    fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }

    fn create_variable(&mut self, spec: VariableSpec) -> Result<()> {
        if let Some(existing) = self.variables.get(&spec.name) {
            if existing.spec == spec {
                return Ok(());
            }
            return Err(Error::Storage(format!(
                "Variable '{}' already exists with a different layout",
                spec.name
            )));
        }
        let row_bytes = row_elements(&self.dimensions, &spec)? * spec.var_type.element_size();
        self.variables.insert(
            spec.name.clone(),
            MemoryVariable {
                spec,
                row_bytes,
                data: Vec::new(),
            },
        );
        Ok(())
    }

    fn variable(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.get(name).map(|v| &v.spec)
    }

    fn row_bytes(&self, name: &str) -> Result<usize> {
        Ok(self.var(name)?.row_bytes)
    }

    fn row_count(&self, name: &str) -> Result<usize> {
        Ok(self.var(name)?.rows())
    }

    fn read_rows(&mut self, name: &str, start: usize, count: usize) -> Result<Vec<u8>> {
        let var = self
            .variables
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Variable '{}'", name)))?;
        let end = (start + count).min(var.rows());
        let bytes = if start >= end {
            Vec::new()
        } else {
            var.data[start * var.row_bytes..end * var.row_bytes].to_vec()
        };

        self.stats.read_calls += 1;
        self.stats.rows_read += end.saturating_sub(start) as u64;
        Ok(bytes)
    }

    fn write_row(&mut self, name: &str, row: usize, data: &[u8]) -> Result<()> {
        let var = self
            .variables
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Variable '{}'", name)))?;
        if data.len() != var.row_bytes {
            return Err(Error::Storage(format!(
                "Row of {} bytes does not fit variable '{}' ({} bytes per row)",
                data.len(),
                name,
                var.row_bytes
            )));
        }

        let offset = row * var.row_bytes;
        if var.data.len() < offset + var.row_bytes {
            var.data.resize(offset + var.row_bytes, 0);
        }
        var.data[offset..offset + var.row_bytes].copy_from_slice(data);

        self.stats.rows_written += 1;
        Ok(())
    }

    fn set_reference(
        &mut self,
        table: &str,
        position: usize,
        reference: serde_json::Value,
    ) -> Result<()> {
        let entries = self.references.entry(table.to_string()).or_default();
        match position.cmp(&entries.len()) {
            std::cmp::Ordering::Less => entries[position] = reference,
            std::cmp::Ordering::Equal => entries.push(reference),
            std::cmp::Ordering::Greater => {
                return Err(Error::Storage(format!(
                    "Reference table '{}' has {} entries, cannot set position {}",
                    table,
                    entries.len(),
                    position
                )))
            }
        }
        Ok(())
    }

    fn references(&self, table: &str) -> Vec<serde_json::Value> {
        self.references.get(table).cloned().unwrap_or_default()
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> FileStats {
        self.stats
    }
}
