//! Memory-layout aware register conversions
//!
//! Every reordering here is its own inverse, so the same permutation turns
//! wire bytes into canonical big-endian bytes and back.

use errors::{CollectError, CollectResult};

use crate::types::{ByteOrder, DataType, Value};

/// Reorder 4 bytes between wire order and ABCD
#[inline]
pub fn reorder_4(b: [u8; 4], order: ByteOrder) -> [u8; 4] {
    match order {
        ByteOrder::BigEndian => b,
        ByteOrder::LittleEndian => [b[3], b[2], b[1], b[0]],
        ByteOrder::BigEndianSwap => [b[2], b[3], b[0], b[1]],
        ByteOrder::LittleEndianSwap => [b[1], b[0], b[3], b[2]],
    }
}

/// Reorder 8 bytes between wire order and ABCDEFGH
#[inline]
pub fn reorder_8(b: [u8; 8], order: ByteOrder) -> [u8; 8] {
    match order {
        ByteOrder::BigEndian => b,
        ByteOrder::LittleEndian => [b[7], b[6], b[5], b[4], b[3], b[2], b[1], b[0]],
        ByteOrder::BigEndianSwap => [b[6], b[7], b[4], b[5], b[2], b[3], b[0], b[1]],
        ByteOrder::LittleEndianSwap => [b[1], b[0], b[3], b[2], b[5], b[4], b[7], b[6]],
    }
}

/// Read one register
#[inline]
pub fn read_u16(b: [u8; 2], order: ByteOrder) -> u16 {
    if order.register_is_big_endian() {
        u16::from_be_bytes(b)
    } else {
        u16::from_le_bytes(b)
    }
}

/// Write one register
#[inline]
pub fn write_u16(value: u16, order: ByteOrder) -> [u8; 2] {
    if order.register_is_big_endian() {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    }
}

fn take<const N: usize>(data: &[u8]) -> CollectResult<[u8; N]> {
    data.get(..N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or(CollectError::InsufficientResponseLength {
            expected: N,
            actual: data.len(),
        })
}

/// Decode the raw (unscaled) value at the start of `data`
pub fn decode_raw(data: &[u8], data_type: DataType, order: ByteOrder) -> CollectResult<Value> {
    let value = match data_type {
        DataType::Bool => Value::Bool(read_u16(take::<2>(data)?, order) != 0),
        DataType::Int16 => Value::Int(i64::from(read_u16(take::<2>(data)?, order) as i16)),
        DataType::Uint16 => Value::Int(i64::from(read_u16(take::<2>(data)?, order))),
        DataType::Int32 => Value::Int(i64::from(i32::from_be_bytes(reorder_4(
            take::<4>(data)?,
            order,
        )))),
        DataType::Float32 => Value::Float(f64::from(f32::from_be_bytes(reorder_4(
            take::<4>(data)?,
            order,
        )))),
        DataType::Int64 => Value::Int(i64::from_be_bytes(reorder_8(take::<8>(data)?, order))),
        DataType::Float64 => Value::Float(f64::from_be_bytes(reorder_8(take::<8>(data)?, order))),
    };
    Ok(value)
}

/// Encode a value into register bytes in wire order
///
/// The value must already fit `data_type`; integers are truncated and
/// floats cast without further checks.
pub fn encode_raw(value: Value, data_type: DataType, order: ByteOrder) -> Vec<u8> {
    match data_type {
        DataType::Bool => write_u16(u16::from(value.as_bool()), order).to_vec(),
        DataType::Int16 => write_u16(as_i64(value) as i16 as u16, order).to_vec(),
        DataType::Uint16 => write_u16(as_i64(value) as u16, order).to_vec(),
        DataType::Int32 => reorder_4((as_i64(value) as i32).to_be_bytes(), order).to_vec(),
        DataType::Float32 => reorder_4((value.as_f64() as f32).to_be_bytes(), order).to_vec(),
        DataType::Int64 => reorder_8(as_i64(value).to_be_bytes(), order).to_vec(),
        DataType::Float64 => reorder_8(value.as_f64().to_be_bytes(), order).to_vec(),
    }
}

fn as_i64(value: Value) -> i64 {
    match value {
        Value::Bool(b) => i64::from(b),
        Value::Int(i) => i,
        Value::Float(f) => f.round() as i64,
    }
}

/// Expand a packed coil bitmap into one byte (0/1) per bit, LSB first
pub fn expand_bits(packed: &[u8], count: usize) -> Vec<u8> {
    (0..count)
        .map(|i| {
            packed
                .get(i >> 3)
                .map_or(0, |byte| u8::from(byte & (1 << (i & 7)) != 0))
        })
        .collect()
}
