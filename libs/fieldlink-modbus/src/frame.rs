//! Frame packing
//!
//! Variables are grouped by read function code and sorted by address. Each
//! group is walked once; a variable joins the open frame when its last bit or
//! word still fits within `start + limit`, otherwise the open frame is closed
//! and the variable starts a fresh one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};

use errors::{CollectError, CollectResult};
use tracing::debug;

use crate::codec::decode_frame;
use crate::constants::{
    is_bit_function, is_read_function, MAX_BITS_PER_REQUEST, MAX_WORDS_PER_REQUEST,
};
use crate::pdu::PduBuilder;
use crate::types::{ByteOrder, DataType, Device, Transport, VariableValue};

/// Where one variable sits inside a frame's payload
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSlot {
    /// Index into `Device::variables`
    pub index: usize,
    pub name: String,
    pub data_type: DataType,
    pub rate: f64,
    pub bits: Option<u8>,
    /// Bit offset for coils, byte offset for registers
    pub offset: usize,
}

/// A wire-ready read request plus the shape of its answer
#[derive(Debug)]
pub struct RequestFrame {
    pub transport: Transport,
    pub slave: u8,
    pub function_code: u8,
    pub byte_order: ByteOrder,
    /// First configured address covered
    pub start_address: u16,
    /// Start address sent on the wire (`start_address - positionAddress`)
    pub wire_address: u16,
    /// Bits or registers requested
    pub quantity: u16,
    pub expected_len: usize,
    pub slots: Vec<VariableSlot>,
    request: Vec<u8>,
    transaction_id: AtomicU16,
}

impl RequestFrame {
    /// Stamp the next transaction id onto a copy of the request
    pub fn next_request(&self) -> (u16, Vec<u8>) {
        let txn = self
            .transaction_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let mut bytes = self.request.clone();
        self.transport.stamp_transaction_id(&mut bytes, txn);
        (txn, bytes)
    }

    /// Validate a raw response to the request carrying `transaction_id`
    /// and return its payload
    pub fn validate<'a>(&self, response: &'a [u8], transaction_id: u16) -> CollectResult<&'a [u8]> {
        self.transport
            .validate_read_response(response, transaction_id, self.slave, self.function_code)
    }

    /// Decode a validated payload
    pub fn decode(&self, payload: &[u8]) -> CollectResult<Vec<(usize, VariableValue)>> {
        decode_frame(self, payload)
    }

    /// Address range covered, end exclusive
    pub fn span(&self) -> (u32, u32) {
        let start = u32::from(self.start_address);
        (start, start + u32::from(self.quantity))
    }
}

struct OpenFrame {
    start: u32,
    end: u32,
    members: Vec<(usize, u32)>,
}

/// Pack every variable of `device` into read frames
///
/// Frames are ordered by function code, then address. A device without
/// variables yields `EmptyVariableSet`.
pub fn pack_frames(device: &Device) -> CollectResult<Vec<RequestFrame>> {
    if device.variables.is_empty() {
        return Err(CollectError::EmptyVariableSet);
    }

    let mut groups: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (index, variable) in device.variables.iter().enumerate() {
        if !is_read_function(variable.function_code) {
            return Err(CollectError::invalid_config(
                format!("{}.variables.{}.functionCode", device.id, variable.name),
                format!("FC{:02} is not a read function", variable.function_code),
            ));
        }
        groups.entry(variable.function_code).or_default().push(index);
    }

    let mut frames = Vec::new();
    for (fc, mut members) in groups {
        members.sort_by_key(|&i| device.variables[i].address);

        let bit = is_bit_function(fc);
        let limit = u32::from(if bit {
            MAX_BITS_PER_REQUEST
        } else {
            MAX_WORDS_PER_REQUEST
        });

        let mut open: Option<OpenFrame> = None;
        for index in members {
            let variable = &device.variables[index];
            let address = u32::from(variable.address);
            let width = if bit {
                1
            } else {
                u32::from(variable.data_type.words())
            };

            match open.as_mut() {
                Some(frame) if address + width <= frame.start + limit => {
                    frame.end = frame.end.max(address + width);
                    frame.members.push((index, address));
                },
                _ => {
                    if let Some(done) = open.take() {
                        frames.push(build_frame(device, fc, done)?);
                    }
                    open = Some(OpenFrame {
                        start: address,
                        end: address + width,
                        members: vec![(index, address)],
                    });
                },
            }
        }
        if let Some(done) = open {
            frames.push(build_frame(device, fc, done)?);
        }
    }

    debug!(
        "Dev{}: {} vars packed into {} frames",
        device.id,
        device.variables.len(),
        frames.len()
    );
    Ok(frames)
}

fn build_frame(device: &Device, fc: u8, open: OpenFrame) -> CollectResult<RequestFrame> {
    let start_address = open.start as u16;
    let quantity = (open.end - open.start) as u16;
    let wire_address = start_address
        .checked_sub(device.position_address)
        .ok_or_else(|| {
            CollectError::invalid_config(
                format!("{}.positionAddress", device.id),
                format!(
                    "frame start {} below position address {}",
                    start_address, device.position_address
                ),
            )
        })?;

    let bit = is_bit_function(fc);
    let slots = open
        .members
        .into_iter()
        .map(|(index, address)| {
            let variable = &device.variables[index];
            let delta = (address - open.start) as usize;
            VariableSlot {
                index,
                name: variable.name.clone(),
                data_type: variable.data_type,
                rate: variable.rate,
                bits: variable.bits,
                offset: if bit { delta } else { delta * 2 },
            }
        })
        .collect();

    let pdu = PduBuilder::read_request(fc, wire_address, quantity)?;
    let transport = device.device_model;

    Ok(RequestFrame {
        transport,
        slave: device.slave,
        function_code: fc,
        byte_order: device.memory_layout,
        start_address,
        wire_address,
        quantity,
        expected_len: transport.expected_read_len(fc, quantity),
        slots,
        request: transport.encode(0, device.slave, pdu.as_slice()),
        transaction_id: AtomicU16::new(0),
    })
}
