//! Chunked column cache
//!
//! Rows are fetched from the backing file a chunk at a time: a miss on
//! row `r` of a column loads rows `[c * chunk_rows, (c + 1) * chunk_rows)`
//! where `c = r / chunk_rows`, using the chunk size declared by the
//! variable. Writes go through the cache and invalidate the chunk they
//! touch. A limit of 0 chunks disables caching.

use super::cache::CacheStats;
use super::file::ArrayFile;
use crate::error::{Error, Result};
use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::trace;

type ChunkKey = (String, usize);

pub struct ChunkCache {
    chunks: Option<LruCache<ChunkKey, Vec<u8>>>,
    max_chunks: usize,
    hits: u64,
    misses: u64,
}

impl ChunkCache {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: NonZeroUsize::new(max_chunks).map(LruCache::new),
            max_chunks,
            hits: 0,
            misses: 0,
        }
    }

    /// Read one row of `variable`
    pub fn read_row(
        &mut self,
        file: &mut dyn ArrayFile,
        variable: &str,
        row: usize,
    ) -> Result<Vec<u8>> {
        let rows = file.row_count(variable)?;
        if row >= rows {
            return Err(Error::NotFound(format!(
                "Row {} of '{}' ({} rows written)",
                row, variable, rows
            )));
        }

        let Some(chunks) = self.chunks.as_mut() else {
            return file.read_rows(variable, row, 1);
        };

        let row_bytes = file.row_bytes(variable)?;
        let chunk_rows = file.variable(variable).map_or(1, |v| v.chunk_rows.max(1));
        let chunk = row / chunk_rows;
        let offset = (row - chunk * chunk_rows) * row_bytes;
        let key = (variable.to_string(), chunk);

        if let Some(data) = chunks.get(&key) {
            // A chunk loaded before the column grew may be short
            if offset + row_bytes <= data.len() {
                self.hits += 1;
                return Ok(data[offset..offset + row_bytes].to_vec());
            }
        }

        self.misses += 1;
        let data = file.read_rows(variable, chunk * chunk_rows, chunk_rows)?;
        trace!(variable, chunk, bytes = data.len(), "Loaded chunk");
        let out = data
            .get(offset..offset + row_bytes)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                Error::Storage(format!("Chunk {} of '{}' is truncated", chunk, variable))
            })?;
        chunks.put(key, data);
        Ok(out)
    }

    /// Write one row through to the file and drop the stale chunk
    pub fn write_row(
        &mut self,
        file: &mut dyn ArrayFile,
        variable: &str,
        row: usize,
        data: &[u8],
    ) -> Result<()> {
        file.write_row(variable, row, data)?;
        if let Some(chunks) = self.chunks.as_mut() {
            let chunk_rows = file.variable(variable).map_or(1, |v| v.chunk_rows.max(1));
            chunks.pop(&(variable.to_string(), row / chunk_rows));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        if let Some(chunks) = self.chunks.as_mut() {
            chunks.clear();
        }
    }

    /// Number of chunks held
    pub fn len(&self) -> usize {
        self.chunks.as_ref().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::new(self.hits, self.misses, self.len(), self.max_chunks)
    }
}
