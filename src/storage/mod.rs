//! Storage layer
//!
//! # Architecture
//!
//! pathstore keeps snapshots in paired slots of a columnar array file:
//!
//! ```text
//! SnapshotStorage (wrapper: uuid + store columns, one row per pair)
//!   └─→ SnapshotCodec per descriptor (one column per field)
//!        └─→ row n = slots (2n, 2n + 1) = forward state and its reversal
//! ```
//!
//! ## Components
//!
//! - **ReversalIndex**: identity → slot, inserting both directions at once
//! - **SlotAllocator**: hands out slot pairs, tracks reservations and rollback
//! - **SnapshotCodec**: encodes one descriptor's fields into typed columns
//! - **WeakLruCache**: materialized snapshots, demoted to weak refs on eviction
//! - **ChunkCache**: column rows, loaded a chunk at a time
//! - **DerivedValueStore**: memoized computations over stored snapshots
//! - **LoaderProxy / SnapshotRef**: lazy references to stored snapshots
//!
//! ## Backing files
//!
//! Anything implementing `ArrayFile`; `MemoryArrayFile` for tests and
//! scratch work, `DirectoryArrayFile` for persistent stores.

pub mod allocator;
pub mod cache;
pub mod chunk_cache;
pub mod codec;
pub mod column;
pub mod file;
pub mod index;
pub mod proxy;
pub mod slot;
pub mod store;
pub mod values;

pub use allocator::SlotAllocator;
pub use cache::{CacheStats, WeakLruCache};
pub use chunk_cache::ChunkCache;
pub use codec::SnapshotCodec;
pub use file::{ArrayFile, DirectoryArrayFile, MemoryArrayFile, VarType, VariableSpec};
pub use index::ReversalIndex;
pub use proxy::{LoaderProxy, SnapshotRef};
pub use slot::{Slot, SlotState};
pub use store::{SnapshotStorage, StorageStats};
pub use values::{Computation, CvHandle, DerivedValueStore, FnComputation};
