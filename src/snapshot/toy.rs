//! Toy snapshot type: positions and velocities of point particles
//!
//! Velocities flip sign under time reversal, positions do not.

use super::{FieldDescriptor, Reversal, Snapshot, SnapshotDescriptor, Value};
use crate::error::Result;
use std::sync::Arc;

pub const CLASS: &str = "toy";

pub fn descriptor(n_atoms: usize, n_spatial: usize) -> Result<Arc<SnapshotDescriptor>> {
    SnapshotDescriptor::builder(CLASS)
        .dimension("n_atoms", n_atoms)
        .dimension("n_spatial", n_spatial)
        .field(FieldDescriptor::float("coordinates", &["n_atoms", "n_spatial"]))
        .field(
            FieldDescriptor::float("velocities", &["n_atoms", "n_spatial"])
                .with_reversal(Reversal::Negate),
        )
        .build()
}

/// Build a toy snapshot from flat row-major data
pub fn snapshot(
    descriptor: &Arc<SnapshotDescriptor>,
    coordinates: Vec<f64>,
    velocities: Vec<f64>,
) -> Result<Snapshot> {
    let shape = [
        descriptor.dimensions().get("n_atoms").copied().unwrap_or(0),
        descriptor.dimensions().get("n_spatial").copied().unwrap_or(0),
    ];
    Snapshot::new(
        Arc::clone(descriptor),
        vec![
            ("coordinates", Value::float(&shape, coordinates)?),
            ("velocities", Value::float(&shape, velocities)?),
        ],
    )
}
