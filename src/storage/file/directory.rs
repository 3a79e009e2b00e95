//! Directory-backed array file
//!
//! # Layout
//!
//! ```text
//! <base>/manifest.json        dimensions, variable specs, reference tables
//! <base>/<variable>.col       fixed-width rows, row r at offset r * row_bytes
//! ```
//!
//! The manifest is rewritten atomically (temp file + rename) whenever the
//! layout or a reference table changes. Row counts are not stored: they
//! are recovered from the column file lengths on open.

use super::{check_dimension, row_elements, ArrayFile, Dimension, FileStats, VariableSpec};
use crate::error::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MANIFEST: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    dimensions: Vec<Dimension>,
    variables: Vec<VariableSpec>,
    references: BTreeMap<String, Vec<serde_json::Value>>,
}

#[derive(Debug)]
struct DiskVariable {
    spec: VariableSpec,
    row_bytes: usize,
    rows: usize,
    file: File,
}

/// Array file stored as one column file per variable
#[derive(Debug)]
pub struct DirectoryArrayFile {
    base_path: PathBuf,
    dimensions: BTreeMap<String, Dimension>,
    variables: BTreeMap<String, DiskVariable>,
    references: BTreeMap<String, Vec<serde_json::Value>>,
    stats: FileStats,
}

impl DirectoryArrayFile {
    /// Create or open an array file in `base_path`
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;

        let mut file = Self {
            base_path,
            dimensions: BTreeMap::new(),
            variables: BTreeMap::new(),
            references: BTreeMap::new(),
            stats: FileStats::default(),
        };

        let manifest_path = file.base_path.join(MANIFEST);
        if !manifest_path.exists() {
            info!(path = ?file.base_path, "No manifest found, starting fresh array file");
            return Ok(file);
        }

        let manifest: Manifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Storage(format!(
                "Unsupported manifest version {} in {:?}",
                manifest.version, manifest_path
            )));
        }

        for dim in manifest.dimensions {
            file.dimensions.insert(dim.name.clone(), dim);
        }
        for spec in manifest.variables {
            let var = file.open_variable(spec)?;
            file.variables.insert(var.spec.name.clone(), var);
        }
        file.references = manifest.references;

        info!(
            path = ?file.base_path,
            dimensions = file.dimensions.len(),
            variables = file.variables.len(),
            "Opened array file"
        );
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    fn open_variable(&self, spec: VariableSpec) -> Result<DiskVariable> {
        let row_bytes = row_elements(&self.dimensions, &spec)? * spec.var_type.element_size();
        let path = self.base_path.join(format!("{}.col", spec.name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let rows = (file.metadata()?.len() / row_bytes as u64) as usize;

        debug!(variable = %spec.name, rows, row_bytes, "Opened column file");
        Ok(DiskVariable {
            spec,
            row_bytes,
            rows,
            file,
        })
    }

    fn var(&self, name: &str) -> Result<&DiskVariable> {
        self.variables
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Variable '{}'", name)))
    }

    fn var_mut(&mut self, name: &str) -> Result<&mut DiskVariable> {
        self.variables
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Variable '{}'", name)))
    }

    /// Rewrite the manifest via temp file + rename
    fn write_manifest(&self) -> Result<()> {
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            dimensions: self.dimensions.values().cloned().collect(),
            variables: self.variables.values().map(|v| v.spec.clone()).collect(),
            references: self.references.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;

        let path = self.base_path.join(MANIFEST);
        let temp_path = path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &path)?;

        debug!(bytes = bytes.len(), "Wrote manifest");
        Ok(())
    }
}

impl ArrayFile for DirectoryArrayFile {
    fn create_dimension(&mut self, name: &str, size: Option<usize>) -> Result<()> {
        if check_dimension(&self.dimensions, name, size)? {
            self.dimensions.insert(
                name.to_string(),
                Dimension {
                    name: name.to_string(),
                    size,
                },
            );
            self.write_manifest()?;
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
        let var = self.open_variable(spec)?;
        self.variables.insert(var.spec.name.clone(), var);
        self.write_manifest()
    }

    fn variable(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.get(name).map(|v| &v.spec)
    }

    fn row_bytes(&self, name: &str) -> Result<usize> {
        Ok(self.var(name)?.row_bytes)
    }

    fn row_count(&self, name: &str) -> Result<usize> {
        Ok(self.var(name)?.rows)
    }

    fn read_rows(&mut self, name: &str, start: usize, count: usize) -> Result<Vec<u8>> {
        let var = self.var_mut(name)?;
        let end = (start + count).min(var.rows);
        if start >= end {
            return Ok(Vec::new());
        }

        let mut data = vec![0u8; (end - start) * var.row_bytes];
        var.file
            .seek(SeekFrom::Start((start * var.row_bytes) as u64))?;
        var.file.read_exact(&mut data)?;

        self.stats.read_calls += 1;
        self.stats.rows_read += (end - start) as u64;
        Ok(data)
    }

    fn write_row(&mut self, name: &str, row: usize, data: &[u8]) -> Result<()> {
        let var = self.var_mut(name)?;
        if data.len() != var.row_bytes {
            return Err(Error::Storage(format!(
                "Row of {} bytes does not fit variable '{}' ({} bytes per row)",
                data.len(),
                name,
                var.row_bytes
            )));
        }

        var.file
            .seek(SeekFrom::Start((row * var.row_bytes) as u64))?;
        var.file.write_all(data)?;
        var.rows = var.rows.max(row + 1);

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
        if position < entries.len() {
            entries[position] = reference;
        } else if position == entries.len() {
            entries.push(reference);
        } else {
            return Err(Error::Storage(format!(
                "Reference table '{}' has {} entries, cannot set position {}",
                table,
                entries.len(),
                position
            )));
        }
        self.write_manifest()
    }

    fn references(&self, table: &str) -> Vec<serde_json::Value> {
        self.references.get(table).cloned().unwrap_or_default()
    }

    fn sync(&mut self) -> Result<()> {
        self.variables
            .par_iter()
            .try_for_each(|(_, var)| var.file.sync_all())?;
        self.write_manifest()?;
        debug!(variables = self.variables.len(), "Synced array file");
        Ok(())
    }

    fn stats(&self) -> FileStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::VarType;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pathstore_dir_{}_{}", name, std::process::id()))
    }

    fn create_column(file: &mut DirectoryArrayFile) -> Result<()> {
        file.create_dimension("rows", None)?;
        file.create_dimension("width", Some(3))?;
        file.create_variable(VariableSpec::new(
            "col",
            VarType::Float64,
            vec!["rows".into(), "width".into()],
        ))
    }

    #[test]
    fn test_directory_file_basic() -> Result<()> {
        let temp_dir = temp_dir("basic");
        std::fs::remove_dir_all(&temp_dir).ok();
        let mut file = DirectoryArrayFile::open(&temp_dir)?;
        create_column(&mut file)?;

        file.write_row("col", 1, &[7u8; 24])?;
        assert_eq!(file.row_count("col")?, 2);

        let data = file.read_rows("col", 0, 5)?;
        assert_eq!(data.len(), 48);
        assert_eq!(&data[..24], &[0u8; 24]);
        assert_eq!(&data[24..], &[7u8; 24]);

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_directory_file_reopen() -> Result<()> {
        let temp_dir = temp_dir("reopen");
        std::fs::remove_dir_all(&temp_dir).ok();

        {
            let mut file = DirectoryArrayFile::open(&temp_dir)?;
            create_column(&mut file)?;
            file.write_row("col", 0, &[1u8; 24])?;
            file.write_row("col", 1, &[2u8; 24])?;
            file.set_reference("types", 0, serde_json::json!({"name": "toy"}))?;
            file.sync()?;
        }

        {
            let mut file = DirectoryArrayFile::open(&temp_dir)?;
            assert_eq!(file.dimension("width").and_then(|d| d.size), Some(3));
            assert_eq!(file.row_count("col")?, 2);
            assert_eq!(file.read_rows("col", 1, 1)?, vec![2u8; 24]);
            assert_eq!(file.references("types")[0]["name"], "toy");
        }

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }
}
