//! End-to-end storage scenarios

use pathstore::error::{Error, Result};
use pathstore::snapshot::toy;
use pathstore::storage::{SlotState, VarType};
use pathstore::{
    ArrayFile, Computation, DirectoryArrayFile, FieldDescriptor, FnComputation, MemoryArrayFile,
    MissingTypePolicy, Reversal, Slot, Snapshot, SnapshotDescriptor, SnapshotRef,
    SnapshotStorage, StoreConfig, Value,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn memory_store(config: StoreConfig) -> Result<SnapshotStorage<MemoryArrayFile>> {
    SnapshotStorage::create(MemoryArrayFile::new(), config)
}

fn toy_snapshot(n_atoms: usize, seed: f64) -> Result<Arc<Snapshot>> {
    let descriptor = toy::descriptor(n_atoms, 3)?;
    let coords = (0..n_atoms * 3).map(|i| seed * 10.0 + i as f64).collect();
    let vels = (0..n_atoms * 3).map(|i| seed - 0.5 * i as f64).collect();
    Ok(Arc::new(toy::snapshot(&descriptor, coords, vels)?))
}

#[test]
fn test_sibling_loads_reversal_without_writes() -> Result<()> {
    let descriptor = SnapshotDescriptor::builder("velocity")
        .dimension("n", 3)
        .field(FieldDescriptor::float("v", &["n"]).with_reversal(Reversal::Negate))
        .build()?;
    let snapshot = Arc::new(Snapshot::new(
        descriptor,
        vec![("v", Value::from(vec![1.0, 2.0, 3.0]))],
    )?);

    let mut storage = memory_store(StoreConfig::default())?;
    let slot = storage.save(&snapshot)?;
    let written = storage.file().stats().rows_written;

    let reversed = storage.load(slot.sibling())?;
    assert_eq!(reversed.get("v"), Some(&Value::from(vec![-1.0, -2.0, -3.0])));
    assert_eq!(reversed.id(), snapshot.id().reversed());
    assert_eq!(storage.file().stats().rows_written, written);
    assert_eq!(storage.slot_of(&reversed), Some(slot.sibling()));
    Ok(())
}

#[test]
fn test_mixed_types_survive_reopen() -> Result<()> {
    let temp_dir = std::env::temp_dir().join(format!("pathstore_mixed_{}", std::process::id()));
    std::fs::remove_dir_all(&temp_dir).ok();

    let small = toy_snapshot(3, 1.0)?;
    let large = toy_snapshot(5, 2.0)?;
    let (small_slot, large_slot) = {
        let mut storage =
            SnapshotStorage::create(DirectoryArrayFile::open(&temp_dir)?, StoreConfig::default())?;
        let slots = (storage.save(&small)?, storage.save(&large)?);
        assert_eq!(storage.descriptors().count(), 2);
        storage.close()?;
        slots
    };

    let mut storage =
        SnapshotStorage::open(DirectoryArrayFile::open(&temp_dir)?, StoreConfig::default())?;
    assert_eq!(storage.descriptors().count(), 2);
    assert_eq!(*storage.load(small_slot)?, *small);
    assert_eq!(*storage.load(large_slot)?, *large);
    assert_eq!(*storage.load(large_slot.sibling())?, large.reversed());
    assert_eq!(*storage.load_id(small.id().reversed())?, small.reversed());

    // Saving again after reopen is still deduplicated
    assert_eq!(storage.save(&large)?, large_slot);
    assert_eq!(storage.stats().attribute_writes, 0);

    // Cleanup
    std::fs::remove_dir_all(temp_dir).ok();
    Ok(())
}

#[test]
fn test_fail_policy_allocates_nothing() -> Result<()> {
    let config = StoreConfig::default().with_missing_type_policy(MissingTypePolicy::Fail);
    let mut storage = memory_store(config)?;
    let snapshot = toy_snapshot(2, 0.0)?;

    let before = storage.stats().high_water;
    assert!(matches!(
        storage.save(&snapshot),
        Err(Error::MissingTypeSupport(_))
    ));
    assert_eq!(storage.stats().high_water, before);
    assert!(storage.slot_of(&snapshot).is_none());

    // Registering the type explicitly makes it storable
    storage.add_type(Arc::clone(snapshot.descriptor()))?;
    assert_eq!(storage.save(&snapshot)?, Slot::new(0));
    Ok(())
}

#[test]
fn test_weak_cache_keeps_held_snapshots() -> Result<()> {
    const CAPACITY: usize = 10;
    let config = StoreConfig {
        object_cache_capacity: CAPACITY,
        ..StoreConfig::default()
    };
    let mut storage = memory_store(config)?;

    let mut held = Vec::new();
    let mut slots = Vec::new();
    for i in 0..CAPACITY + 5 {
        let snapshot = toy_snapshot(1, i as f64)?;
        slots.push(storage.save(&snapshot)?);
        if i < 3 {
            held.push(snapshot);
        }
    }

    let reads = storage.stats().codec_reads;
    let hits = storage.stats().objects.hits;
    for (slot, snapshot) in slots.iter().zip(held.iter()) {
        let loaded = storage.load(*slot)?;
        assert!(Arc::ptr_eq(&loaded, snapshot));
    }
    assert_eq!(storage.stats().objects.hits, hits + 3);
    assert_eq!(storage.stats().codec_reads, reads);

    // Entries 4 and 5 were evicted and nothing else held them
    for slot in &slots[3..5] {
        storage.load(*slot)?;
    }
    assert_eq!(storage.stats().codec_reads, reads + 2);
    Ok(())
}

#[test]
fn test_reversible_value_shared_by_pair() -> Result<()> {
    let evaluations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evaluations);
    let kinetic: Arc<dyn Computation> = Arc::new(FnComputation::new(
        "kinetic",
        true,
        move |s: &Snapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
            let energy = s
                .get("velocities")
                .and_then(Value::as_float)
                .map_or(0.0, |v| 0.5 * v.iter().map(|x| x * x).sum::<f64>());
            Ok(Value::scalar(energy))
        },
    ));

    let mut storage = memory_store(StoreConfig::default())?;
    let snapshot = toy_snapshot(2, 1.0)?;
    let reversed = Arc::new(snapshot.reversed());
    storage.save(&snapshot)?;

    let handle = storage.add_cv(kinetic, &snapshot)?;
    let forward_value = storage.cv_value(handle, &snapshot)?;
    let reversed_value = storage.cv_value(handle, &reversed)?;
    assert_eq!(forward_value, reversed_value);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    assert_eq!(storage.cv(handle).map(|cv| cv.len()), Some(1));

    // Unsaved pairs share a volatile entry
    let unsaved = toy_snapshot(2, 7.0)?;
    storage.cv_value(handle, &unsaved)?;
    storage.cv_value(handle, &Arc::new(unsaved.reversed()))?;
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_save_ref_accepts_own_proxies() -> Result<()> {
    let mut storage = memory_store(StoreConfig::default())?;
    let snapshot = toy_snapshot(1, 3.0)?;
    let slot = storage.save(&snapshot)?;

    let proxy = SnapshotRef::from(storage.proxy(slot.sibling())?);
    let writes = storage.file().stats().rows_written;
    assert_eq!(storage.save_ref(&proxy)?, slot.sibling());
    assert_eq!(storage.file().stats().rows_written, writes);

    let fresh = SnapshotRef::from(toy_snapshot(1, 4.0)?);
    assert_eq!(storage.save_ref(&fresh)?, Slot::new(2));

    // A foreign proxy that was never loaded cannot be copied over
    let mut other = memory_store(StoreConfig::default())?;
    assert!(matches!(
        other.save_ref(&proxy),
        Err(Error::InvalidArgument(_))
    ));
    proxy.resolve(&mut storage)?;
    assert_eq!(other.save_ref(&proxy)?, Slot::new(1));
    Ok(())
}

#[test]
fn test_reserved_rows_survive_reopen() -> Result<()> {
    let mut storage = memory_store(StoreConfig::default())?;
    let pending = toy_snapshot(1, 0.0)?;
    let slot = storage.reserve(&pending)?;
    let file = storage.close()?;

    let mut storage = SnapshotStorage::open(file, StoreConfig::default())?;
    assert_eq!(storage.slot_state(slot), SlotState::Reserved);
    assert!(matches!(storage.load(slot), Err(Error::NotFound(_))));
    assert_eq!(storage.save(&pending)?, slot);
    assert_eq!(storage.verify()?, 1);
    Ok(())
}

#[test]
fn test_caches_do_not_change_results() -> Result<()> {
    let mut cached = memory_store(StoreConfig {
        object_cache_capacity: 2,
        chunk_cache_max_chunks: 2,
        chunk_rows: 3,
        ..StoreConfig::default()
    })?;
    let mut uncached = memory_store(StoreConfig::default().without_caches())?;

    let snapshots = (0..8)
        .map(|i| toy_snapshot(1 + i % 3, i as f64))
        .collect::<Result<Vec<_>>>()?;
    for snapshot in &snapshots {
        assert_eq!(cached.save(snapshot)?, uncached.save(snapshot)?);
    }

    for slot in (0..16).rev().map(Slot::new) {
        assert_eq!(*cached.load(slot)?, *uncached.load(slot)?);
    }
    assert!(uncached.stats().objects.hits == 0);
    Ok(())
}

fn mixed_snapshot(
    descriptor: &Arc<SnapshotDescriptor>,
    energy: f64,
    step: i64,
    forward: bool,
) -> Result<Arc<Snapshot>> {
    Ok(Arc::new(Snapshot::new(
        Arc::clone(descriptor),
        vec![
            ("energy", Value::scalar(energy)),
            ("momenta", Value::float(&[2], vec![energy, -energy])?),
            ("step", Value::int(&[], vec![step])?),
            ("charges", Value::int(&[2], vec![-1, 1])?),
            ("flags", Value::bool(&[2], vec![forward, true])?),
        ],
    )?))
}

fn mixed_descriptor() -> Result<Arc<SnapshotDescriptor>> {
    SnapshotDescriptor::builder("mixed")
        .dimension("n", 2)
        .field(FieldDescriptor::new("energy", VarType::Float32, &[]))
        .field(
            FieldDescriptor::new("momenta", VarType::Float32, &["n"])
                .with_reversal(Reversal::Negate),
        )
        .field(FieldDescriptor::new("step", VarType::Int64, &[]).with_reversal(Reversal::Negate))
        .field(FieldDescriptor::new("charges", VarType::Int32, &["n"]))
        .field(FieldDescriptor::new("flags", VarType::Bool, &["n"]).with_reversal(Reversal::Toggle))
        .build()
}

#[test]
fn test_mixed_field_types_round_trip() -> Result<()> {
    let descriptor = mixed_descriptor()?;
    let mut cached = memory_store(StoreConfig::default())?;
    let mut uncached = memory_store(StoreConfig::default().without_caches())?;

    let snapshots = vec![
        mixed_snapshot(&descriptor, 0.1, 7, true)?,
        Arc::new(mixed_snapshot(&descriptor, -2.7, i64::MAX, false)?.reversed()),
        mixed_snapshot(&descriptor, 1.0e-3, i64::MIN + 1, true)?,
    ];
    let mut slots = Vec::new();
    for snapshot in &snapshots {
        let slot = cached.save(snapshot)?;
        assert_eq!(uncached.save(snapshot)?, slot);
        slots.push(slot);
    }

    for (snapshot, slot) in snapshots.iter().zip(&slots) {
        let forward = cached.load(*slot)?;
        let reversed = cached.load(slot.sibling())?;
        assert_eq!(*forward, **snapshot);
        assert_eq!(*reversed, snapshot.reversed());
        assert_eq!(*uncached.load(*slot)?, **snapshot);
        assert_eq!(*uncached.load(slot.sibling())?, snapshot.reversed());

        cached.clear_object_cache();
        cached.clear_chunk_cache();
        assert_eq!(*cached.load(*slot)?, *forward);
        assert_eq!(*cached.load(slot.sibling())?, *reversed);
    }

    let flipped = cached.load(slots[0].sibling())?;
    assert_eq!(flipped.get("flags"), Some(&Value::bool(&[2], vec![false, false])?));
    assert_eq!(flipped.get("step"), Some(&Value::int(&[], vec![-7])?));
    assert_eq!(flipped.get("charges"), Some(&Value::int(&[2], vec![-1, 1])?));
    assert_eq!(cached.verify()?, 3);
    Ok(())
}

#[test]
fn test_unnegatable_step_is_never_stored() -> Result<()> {
    let descriptor = mixed_descriptor()?;
    let mut storage = memory_store(StoreConfig::default())?;
    assert!(matches!(
        mixed_snapshot(&descriptor, 0.0, i64::MIN, true),
        Err(Error::TypeMismatch(_))
    ));

    let edge = mixed_snapshot(&descriptor, 0.0, i64::MIN + 1, true)?;
    let slot = storage.save(&edge)?;
    storage.clear_object_cache();
    let reversed = storage.load(slot.sibling())?;
    assert_eq!(reversed.get("step"), Some(&Value::int(&[], vec![i64::MAX])?));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_round_trip(
        n_atoms in 1usize..4,
        seed in -1.0e6f64..1.0e6,
        reversed_first in any::<bool>(),
    ) {
        let mut storage = memory_store(StoreConfig::default().without_caches()).unwrap();
        let forward = toy_snapshot(n_atoms, seed).unwrap();
        let snapshot = if reversed_first {
            Arc::new(forward.reversed())
        } else {
            forward
        };

        let slot = storage.save(&snapshot).unwrap();
        prop_assert_eq!(&*storage.load(slot).unwrap(), &*snapshot);
        prop_assert_eq!(&*storage.load(slot.sibling()).unwrap(), &snapshot.reversed());
        prop_assert_eq!(storage.slot_of(&snapshot.reversed()), Some(slot.sibling()));
    }
}
