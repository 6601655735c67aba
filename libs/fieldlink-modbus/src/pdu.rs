//! Modbus PDU buffer
//!
//! Fixed-size stack array; a PDU never exceeds 253 bytes.

use errors::{protocol_error, CollectResult};
use tracing::trace;

use crate::constants::{
    is_read_function, EXCEPTION_FLAG, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
};

#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> CollectResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(protocol_error!("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> CollectResult<()> {
        for b in value.to_be_bytes() {
            self.push(b)?;
        }
        Ok(())
    }

    pub fn extend(&mut self, data: &[u8]) -> CollectResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(protocol_error!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            ));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent PDU builder
#[derive(Default)]
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function_code(mut self, fc: u8) -> CollectResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    pub fn address(mut self, addr: u16) -> CollectResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    pub fn quantity(mut self, qty: u16) -> CollectResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    pub fn byte(mut self, b: u8) -> CollectResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    pub fn data(mut self, data: &[u8]) -> CollectResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            trace!(
                "PDU FC{:02X} ({}) {}B",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    /// FC01-04 read request
    pub fn read_request(fc: u8, start_address: u16, quantity: u16) -> CollectResult<ModbusPdu> {
        if !is_read_function(fc) {
            return Err(protocol_error!(
                "read request only supports FC01-04, got FC{:02X}",
                fc
            ));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    /// FC05 / FC06: address plus one 16-bit value
    pub fn write_single(fc: u8, address: u16, value: [u8; 2]) -> CollectResult<ModbusPdu> {
        if !matches!(fc, FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER) {
            return Err(protocol_error!("FC{:02X} is not a single write", fc));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .data(&value)?
            .build())
    }

    /// FC16: address, register count, byte count, register bytes
    pub fn write_multiple_registers(address: u16, data: &[u8]) -> CollectResult<ModbusPdu> {
        if data.is_empty() || data.len() % 2 != 0 {
            return Err(protocol_error!(
                "register payload must be a non-empty even length, got {}",
                data.len()
            ));
        }
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity((data.len() / 2) as u16)?
            .byte(data.len() as u8)?
            .data(data)?
            .build())
    }
}
