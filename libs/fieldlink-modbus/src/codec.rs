//! Value decoding for read payloads and write encoding for actions

use errors::{CollectError, CollectResult};
use tracing::trace;

use crate::bytes::{decode_raw, encode_raw, expand_bits, read_u16, write_u16};
use crate::constants::{is_bit_function, COIL_ON, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER};
use crate::frame::{RequestFrame, VariableSlot};
use crate::pdu::PduBuilder;
use crate::types::{ByteOrder, DataType, Device, Value, Variable, VariableValue};

/// Round to two decimals unless already integral
fn round_noise(v: f64) -> f64 {
    if v.fract() == 0.0 {
        v
    } else {
        (v * 100.0).round() / 100.0
    }
}

/// Apply the variable's rate and float rounding to a raw register value
pub fn scale_value(raw: Value, data_type: DataType, rate: f64) -> Value {
    let scaled = rate != 0.0 && rate != 1.0;
    match raw {
        Value::Bool(_) => raw,
        Value::Int(i) if scaled => {
            let v = round_noise(i as f64 * rate);
            if v.fract() == 0.0 && !data_type.is_float() {
                Value::Int(v as i64)
            } else {
                Value::Float(v)
            }
        },
        Value::Int(_) => raw,
        Value::Float(f) => {
            let v = if scaled { f * rate } else { f };
            Value::Float(round_noise(v))
        },
    }
}

fn decode_slot(
    slot: &VariableSlot,
    function_code: u8,
    payload: &[u8],
    bits: Option<&[u8]>,
    order: ByteOrder,
) -> CollectResult<Value> {
    if is_bit_function(function_code) {
        let bit = bits
            .and_then(|b| b.get(slot.offset))
            .copied()
            .ok_or(CollectError::InsufficientResponseLength {
                expected: slot.offset / 8 + 1,
                actual: payload.len(),
            })?;
        return Ok(match slot.data_type {
            DataType::Bool => Value::Bool(bit == 1),
            DataType::Float32 | DataType::Float64 => Value::Float(f64::from(bit)),
            _ => Value::Int(i64::from(bit)),
        });
    }

    let short = || CollectError::InsufficientResponseLength {
        expected: slot.offset + usize::from(slot.data_type.words()) * 2,
        actual: payload.len(),
    };
    let data = payload.get(slot.offset..).ok_or_else(short)?;

    if let (DataType::Bool, Some(bit)) = (slot.data_type, slot.bits) {
        let word = data
            .get(..2)
            .and_then(|b| <[u8; 2]>::try_from(b).ok())
            .ok_or_else(short)?;
        return Ok(Value::Bool((read_u16(word, order) >> bit) & 1 == 1));
    }

    let raw = decode_raw(data, slot.data_type, order).map_err(|_| short())?;
    Ok(scale_value(raw, slot.data_type, slot.rate))
}

/// Decode a validated payload into `(variable index, value)` pairs
pub fn decode_frame(
    frame: &RequestFrame,
    payload: &[u8],
) -> CollectResult<Vec<(usize, VariableValue)>> {
    let bits = is_bit_function(frame.function_code)
        .then(|| expand_bits(payload, usize::from(frame.quantity)));

    frame
        .slots
        .iter()
        .map(|slot| {
            let value = decode_slot(
                slot,
                frame.function_code,
                payload,
                bits.as_deref(),
                frame.byte_order,
            )?;
            trace!("{} = {}", slot.name, value);
            Ok((
                slot.index,
                VariableValue {
                    name: slot.name.clone(),
                    data_type: slot.data_type,
                    value,
                },
            ))
        })
        .collect()
}

// ============================================================================
// Writes
// ============================================================================

/// One encoded write, ready for the transport envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub variable: String,
    pub function_code: u8,
    pub pdu: Vec<u8>,
}

/// Accepted spellings for boolean strings
fn parse_bool_str(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn coerce_bool(name: &str, value: &serde_json::Value) -> CollectResult<bool> {
    match value {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::String(s) => parse_bool_str(s)
            .ok_or_else(|| CollectError::invalid_value(name, format!("'{}' is not a boolean", s))),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(|v| v > 0.0)
            .ok_or_else(|| CollectError::invalid_value(name, "number out of range")),
        other => Err(CollectError::invalid_value(
            name,
            format!("expected boolean, got {}", other),
        )),
    }
}

fn coerce_number(variable: &Variable, value: &serde_json::Value) -> CollectResult<Value> {
    let name = variable.name.as_str();
    let number = value.as_f64().ok_or_else(|| {
        CollectError::invalid_value(name, format!("expected number, got {}", value))
    })?;
    let raw = if variable.is_scaled() {
        number / variable.rate
    } else {
        number
    };
    if !raw.is_finite() {
        return Err(CollectError::invalid_value(name, "value is not finite"));
    }

    let (min, max) = match variable.data_type {
        DataType::Float32 => {
            if raw.abs() > f64::from(f32::MAX) {
                return Err(CollectError::invalid_value(name, "out of float32 range"));
            }
            return Ok(Value::Float(raw));
        },
        DataType::Float64 => return Ok(Value::Float(raw)),
        DataType::Int16 => (f64::from(i16::MIN), f64::from(i16::MAX)),
        DataType::Uint16 => (0.0, f64::from(u16::MAX)),
        DataType::Int32 => (f64::from(i32::MIN), f64::from(i32::MAX)),
        DataType::Int64 => (i64::MIN as f64, i64::MAX as f64),
        DataType::Bool => {
            return Err(CollectError::UnsupportedWrite(format!(
                "{}: bool on a register",
                name
            )))
        },
    };
    let rounded = raw.round();
    if rounded < min || rounded > max {
        return Err(CollectError::invalid_value(
            name,
            format!("{} out of {} range", rounded, variable.data_type),
        ));
    }
    Ok(Value::Int(rounded as i64))
}

/// Encode an action value for `variable` on `device`
///
/// Coils use FC05, 16-bit registers FC06, wider registers FC16.
pub fn encode_write(
    device: &Device,
    variable: &Variable,
    value: &serde_json::Value,
) -> CollectResult<WriteRequest> {
    let address = variable
        .address
        .checked_sub(device.position_address)
        .ok_or_else(|| {
            CollectError::invalid_config(
                format!("{}.variables.{}.address", device.id, variable.name),
                format!(
                    "address {} below position address {}",
                    variable.address, device.position_address
                ),
            )
        })?;

    let pdu = if is_bit_function(variable.function_code) {
        let on = coerce_bool(&variable.name, value)?;
        let word = if on { COIL_ON } else { 0x0000 };
        PduBuilder::write_single(FC_WRITE_SINGLE_COIL, address, word.to_be_bytes())?
    } else {
        if variable.data_type == DataType::Bool {
            return Err(CollectError::UnsupportedWrite(format!(
                "{}: bool on a register",
                variable.name
            )));
        }
        let typed = coerce_number(variable, value)?;
        match variable.data_type.words() {
            1 => {
                let word = match typed {
                    Value::Int(i) => i as u16,
                    _ => 0,
                };
                PduBuilder::write_single(
                    FC_WRITE_SINGLE_REGISTER,
                    address,
                    write_u16(word, device.memory_layout),
                )?
            },
            _ => PduBuilder::write_multiple_registers(
                address,
                &encode_raw(typed, variable.data_type, device.memory_layout),
            )?,
        }
    };

    Ok(WriteRequest {
        variable: variable.name.clone(),
        function_code: pdu.function_code().unwrap_or_default(),
        pdu: pdu.as_slice().to_vec(),
    })
}
