//! Snapshots: immutable physical-state records
//!
//! # Architecture
//!
//! ```text
//! SnapshotDescriptor (class + dimensions + ordered fields)
//!   └─→ Snapshot (SnapshotId, one Value per field)
//!         └─→ reversed(): same row, id ^ 1, per-field Reversal applied
//! ```
//!
//! A snapshot and its reversal are two logical objects that share one
//! physical row. Forward identities always have their lowest bit clear,
//! so the reversed identity is `id ^ 1` and the pair can be resolved
//! without looking anything up.

pub mod descriptor;
pub mod toy;

pub use descriptor::{DescriptorBuilder, FieldDescriptor, Reversal, SnapshotDescriptor};

use crate::error::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::file::VarType;

/// 128-bit identity of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(u128);

impl SnapshotId {
    /// Creates a new random forward identity
    pub fn new() -> Self {
        Self(Uuid::new_v4().as_u128() & !1)
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.as_u128())
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_u128(self.0)
    }

    /// Identity of the time-reversed counterpart
    pub fn reversed(self) -> Self {
        Self(self.0 ^ 1)
    }

    pub fn is_reversed(&self) -> bool {
        self.0 & 1 == 1
    }

    /// The forward member of the pair this identity belongs to
    pub fn canonical(self) -> Self {
        Self(self.0 & !1)
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid())
    }
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float(ArrayD<f64>),
    Int(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl Value {
    /// Float array from a shape and row-major data
    pub fn float(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Value::Float)
            .map_err(|e| Error::TypeMismatch(format!("Bad float array shape {:?}: {}", shape, e)))
    }

    pub fn int(shape: &[usize], data: Vec<i64>) -> Result<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Value::Int)
            .map_err(|e| Error::TypeMismatch(format!("Bad int array shape {:?}: {}", shape, e)))
    }

    pub fn bool(shape: &[usize], data: Vec<bool>) -> Result<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Value::Bool)
            .map_err(|e| Error::TypeMismatch(format!("Bad bool array shape {:?}: {}", shape, e)))
    }

    /// Zero-dimensional float
    pub fn scalar(x: f64) -> Self {
        Value::Float(ArrayD::from_elem(IxDyn(&[]), x))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Float(a) => a.shape(),
            Value::Int(a) => a.shape(),
            Value::Bool(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Float(a) => a.len(),
            Value::Int(a) => a.len(),
            Value::Bool(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Float(_) => "float",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
        }
    }

    pub fn as_float(&self) -> Option<&ArrayD<f64>> {
        match self {
            Value::Float(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&ArrayD<i64>> {
        match self {
            Value::Int(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&ArrayD<bool>> {
        match self {
            Value::Bool(a) => Some(a),
            _ => None,
        }
    }

    /// Whether this value can live in a column of `var_type`
    pub fn fits(&self, var_type: VarType) -> bool {
        matches!(
            (self, var_type),
            (Value::Float(_), VarType::Float32 | VarType::Float64)
                | (Value::Int(_), VarType::Int32 | VarType::Int64)
                | (Value::Bool(_), VarType::Bool)
        )
    }

    /// Apply a field's reversal rule
    ///
    /// Integer negation wraps; snapshots never hold the one value where
    /// that matters, since `check_value` rejects it.
    pub fn reversed(&self, rule: Reversal) -> Value {
        match (rule, self) {
            (Reversal::Negate, Value::Float(a)) => Value::Float(a.mapv(|x| -x)),
            (Reversal::Negate, Value::Int(a)) => Value::Int(a.mapv(i64::wrapping_neg)),
            (Reversal::Toggle, Value::Bool(a)) => Value::Bool(a.mapv(|x| !x)),
            _ => self.clone(),
        }
    }
}

impl From<Vec<f64>> for Value {
    fn from(data: Vec<f64>) -> Self {
        Value::Float(ndarray::Array1::from(data).into_dyn())
    }
}

/// Immutable record of one system state
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    id: SnapshotId,
    descriptor: Arc<SnapshotDescriptor>,
    values: Vec<Value>,
}

impl Snapshot {
    /// Build a snapshot with a fresh forward identity
    pub fn new<I, S>(descriptor: Arc<SnapshotDescriptor>, attributes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Self::with_id(SnapshotId::new(), descriptor, attributes)
    }

    /// Build a snapshot with a given identity
    ///
    /// Every declared field must be present with a matching type and shape;
    /// undeclared attributes are rejected. Values of float32 fields are
    /// rounded to float32 precision, so they compare equal after a reload.
    pub fn with_id<I, S>(
        id: SnapshotId,
        descriptor: Arc<SnapshotDescriptor>,
        attributes: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let mut given: Vec<(String, Value)> = attributes
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect();

        let mut values = Vec::with_capacity(descriptor.fields().len());
        for field in descriptor.fields() {
            let position = given
                .iter()
                .position(|(name, _)| name == &field.name)
                .ok_or_else(|| {
                    Error::TypeMismatch(format!(
                        "Snapshot of {} is missing attribute '{}'",
                        descriptor.class(),
                        field.name
                    ))
                })?;
            let (_, value) = given.swap_remove(position);
            check_value(&descriptor, field, &value)?;
            values.push(to_column_precision(field.var_type, value));
        }

        if let Some((name, _)) = given.first() {
            return Err(Error::TypeMismatch(format!(
                "Attribute '{}' is not declared by {}",
                name,
                descriptor.class()
            )));
        }

        Ok(Self {
            id,
            descriptor,
            values,
        })
    }

    /// Assemble from values already checked against the descriptor
    pub(crate) fn from_parts(
        id: SnapshotId,
        descriptor: Arc<SnapshotDescriptor>,
        values: Vec<Value>,
    ) -> Self {
        Self {
            id,
            descriptor,
            values,
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<SnapshotDescriptor> {
        &self.descriptor
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.descriptor
            .position(name)
            .and_then(|i| self.values.get(i))
    }

    /// Values in field declaration order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.descriptor
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .zip(self.values.iter())
    }

    /// The time-reversed counterpart, sharing this snapshot's row
    pub fn reversed(&self) -> Snapshot {
        let values = self
            .descriptor
            .fields()
            .iter()
            .zip(self.values.iter())
            .map(|(field, value)| value.reversed(field.reversal))
            .collect();
        Snapshot {
            id: self.id.reversed(),
            descriptor: Arc::clone(&self.descriptor),
            values,
        }
    }

    /// Attribute-wise equality, ignoring identity
    pub fn same_state(&self, other: &Snapshot) -> bool {
        self.descriptor == other.descriptor && self.values == other.values
    }
}

pub(crate) fn check_value(
    descriptor: &SnapshotDescriptor,
    field: &FieldDescriptor,
    value: &Value,
) -> Result<()> {
    if !value.fits(field.var_type) {
        return Err(Error::TypeMismatch(format!(
            "Attribute '{}' expects {:?}, got {}",
            field.name,
            field.var_type,
            value.kind()
        )));
    }
    let shape = descriptor.shape(field)?;
    if value.shape() != shape.as_slice() {
        return Err(Error::TypeMismatch(format!(
            "Attribute '{}' expects shape {:?}, got {:?}",
            field.name,
            shape,
            value.shape()
        )));
    }
    if let (Reversal::Negate, Value::Int(a)) = (field.reversal, value) {
        let min = match field.var_type {
            VarType::Int32 => i64::from(i32::MIN),
            _ => i64::MIN,
        };
        if a.iter().any(|x| *x == min) {
            return Err(Error::TypeMismatch(format!(
                "Attribute '{}' holds {}, which cannot be negated in a {:?} column",
                field.name, min, field.var_type
            )));
        }
    }
    Ok(())
}

fn to_column_precision(var_type: VarType, value: Value) -> Value {
    match (var_type, value) {
        (VarType::Float32, Value::Float(a)) => Value::Float(a.mapv(|x| x as f32 as f64)),
        (_, value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_pairing() {
        let id = SnapshotId::new();
        assert!(!id.is_reversed());
        assert!(id.reversed().is_reversed());
        assert_eq!(id.reversed().reversed(), id);
        assert_eq!(id.reversed().canonical(), id);
    }

    #[test]
    fn test_reversal_negates_velocities_only() -> Result<()> {
        let descriptor = toy::descriptor(3, 1)?;
        let snap = toy::snapshot(&descriptor, vec![0.5, 1.5, 2.5], vec![1.0, 2.0, 3.0])?;
        let rev = snap.reversed();

        assert_eq!(rev.id(), snap.id().reversed());
        assert_eq!(rev.get("coordinates"), snap.get("coordinates"));
        assert_eq!(
            rev.get("velocities"),
            Some(&Value::float(&[3, 1], vec![-1.0, -2.0, -3.0])?)
        );
        assert!(rev.reversed().same_state(&snap));
        Ok(())
    }

    #[test]
    fn test_snapshot_rejects_bad_attributes() -> Result<()> {
        let descriptor = toy::descriptor(2, 1)?;

        let missing = Snapshot::new(
            Arc::clone(&descriptor),
            vec![("coordinates", Value::float(&[2, 1], vec![0.0, 0.0])?)],
        );
        assert!(matches!(missing, Err(Error::TypeMismatch(_))));

        let wrong_shape = toy::snapshot(&descriptor, vec![0.0; 3], vec![0.0; 3]);
        assert!(matches!(wrong_shape, Err(Error::TypeMismatch(_))));

        let wrong_type = Snapshot::new(
            Arc::clone(&descriptor),
            vec![
                ("coordinates", Value::float(&[2, 1], vec![0.0, 0.0])?),
                ("velocities", Value::int(&[2, 1], vec![0, 0])?),
            ],
        );
        assert!(matches!(wrong_type, Err(Error::TypeMismatch(_))));

        let extra = Snapshot::new(
            Arc::clone(&descriptor),
            vec![
                ("coordinates", Value::float(&[2, 1], vec![0.0, 0.0])?),
                ("velocities", Value::float(&[2, 1], vec![0.0, 0.0])?),
                ("box", Value::scalar(1.0)),
            ],
        );
        assert!(matches!(extra, Err(Error::TypeMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_toggle_reversal() -> Result<()> {
        let value = Value::bool(&[2], vec![true, false])?;
        assert_eq!(
            value.reversed(Reversal::Toggle),
            Value::bool(&[2], vec![false, true])?
        );
        assert_eq!(value.reversed(Reversal::Invariant), value);
        Ok(())
    }

    #[test]
    fn test_float32_fields_are_rounded() -> Result<()> {
        let descriptor = SnapshotDescriptor::builder("thermo")
            .field(FieldDescriptor::new("energy", VarType::Float32, &[]))
            .build()?;
        let snap = Snapshot::new(descriptor, vec![("energy", Value::scalar(0.1))])?;
        assert_eq!(snap.get("energy"), Some(&Value::scalar(0.1f32 as f64)));
        Ok(())
    }

    #[test]
    fn test_unnegatable_ints_rejected() -> Result<()> {
        let descriptor = SnapshotDescriptor::builder("counter")
            .field(FieldDescriptor::new("step", VarType::Int64, &[]).with_reversal(Reversal::Negate))
            .field(FieldDescriptor::new("small", VarType::Int32, &[]).with_reversal(Reversal::Negate))
            .build()?;
        let build = |step: i64, small: i64| {
            Snapshot::new(
                Arc::clone(&descriptor),
                vec![
                    ("step", Value::int(&[], vec![step])?),
                    ("small", Value::int(&[], vec![small])?),
                ],
            )
        };

        assert!(matches!(build(i64::MIN, 0), Err(Error::TypeMismatch(_))));
        assert!(matches!(
            build(0, i64::from(i32::MIN)),
            Err(Error::TypeMismatch(_))
        ));

        let snap = build(i64::MIN + 1, i64::from(i32::MIN) + 1)?;
        assert_eq!(snap.reversed().get("step"), Some(&Value::int(&[], vec![i64::MAX])?));
        Ok(())
    }
}
