// pathstore - Rust Implementation
// Paired snapshot storage for path-sampling simulations

#![warn(rust_2018_idioms)]

pub mod config;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use config::{MissingTypePolicy, StoreConfig};
pub use snapshot::{FieldDescriptor, Reversal, Snapshot, SnapshotDescriptor, SnapshotId, Value};
pub use storage::{
    ArrayFile, Computation, CvHandle, DirectoryArrayFile, FnComputation, LoaderProxy,
    MemoryArrayFile, Slot, SnapshotRef, SnapshotStorage,
};

/// pathstore error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Type mismatch: {0}")]
        TypeMismatch(String),

        #[error("Consistency violation: {0}")]
        ConsistencyViolation(String),

        #[error("Missing type support: {0}")]
        MissingTypeSupport(String),

        #[error(transparent)]
        Io(#[from] std::io::Error),

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Serialization error: {0}")]
        SerializationError(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl From<serde_json::Error> for Error {
        fn from(e: serde_json::Error) -> Self {
            Error::SerializationError(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
