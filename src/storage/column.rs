//! Typed column encoding
//!
//! Rows are little-endian, elements in row-major order. Values are checked
//! against the column type before anything is written.

use super::file::VarType;
use crate::error::{Error, Result};
use crate::snapshot::Value;

/// Encode a value as one row of a `var_type` column
pub fn encode(var_type: VarType, value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len() * var_type.element_size());
    match (var_type, value) {
        (VarType::Float64, Value::Float(a)) => {
            a.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes()))
        }
        (VarType::Float32, Value::Float(a)) => a
            .iter()
            .for_each(|x| out.extend_from_slice(&(*x as f32).to_le_bytes())),
        (VarType::Int64, Value::Int(a)) => {
            a.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes()))
        }
        (VarType::Int32, Value::Int(a)) => {
            for x in a.iter() {
                let narrow = i32::try_from(*x).map_err(|_| {
                    Error::TypeMismatch(format!("Value {} does not fit an int32 column", x))
                })?;
                out.extend_from_slice(&narrow.to_le_bytes());
            }
        }
        (VarType::Bool, Value::Bool(a)) => a.iter().for_each(|x| out.push(u8::from(*x))),
        (var_type, value) => {
            return Err(Error::TypeMismatch(format!(
                "Cannot store {} value in {:?} column",
                value.kind(),
                var_type
            )))
        }
    }
    Ok(out)
}

/// Decode one row of a `var_type` column into a value of `shape`
pub fn decode(var_type: VarType, shape: &[usize], bytes: &[u8]) -> Result<Value> {
    let elements: usize = shape.iter().product();
    let expected = elements * var_type.element_size();
    if bytes.len() != expected {
        return Err(Error::Storage(format!(
            "Row has {} bytes, expected {} for {:?} {:?}",
            bytes.len(),
            expected,
            var_type,
            shape
        )));
    }

    match var_type {
        VarType::Float64 => Value::float(
            shape,
            bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(to_array(c)))
                .collect(),
        ),
        VarType::Float32 => Value::float(
            shape,
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(to_array(c)) as f64)
                .collect(),
        ),
        VarType::Int64 => Value::int(
            shape,
            bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(to_array(c)))
                .collect(),
        ),
        VarType::Int32 => Value::int(
            shape,
            bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes(to_array(c)) as i64)
                .collect(),
        ),
        VarType::Bool => Value::bool(shape, bytes.iter().map(|b| *b != 0).collect()),
        VarType::Uuid => Err(Error::TypeMismatch(
            "uuid columns do not hold attribute values".to_string(),
        )),
    }
}

pub fn encode_uuid(id: u128) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

pub fn decode_uuid(bytes: &[u8]) -> Result<u128> {
    if bytes.len() != 16 {
        return Err(Error::Storage(format!("uuid row has {} bytes", bytes.len())));
    }
    Ok(u128::from_le_bytes(to_array(bytes)))
}

pub fn encode_index(index: i64) -> Vec<u8> {
    index.to_le_bytes().to_vec()
}

pub fn decode_index(bytes: &[u8]) -> Result<i64> {
    if bytes.len() != 8 {
        return Err(Error::Storage(format!("index row has {} bytes", bytes.len())));
    }
    Ok(i64::from_le_bytes(to_array(bytes)))
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
