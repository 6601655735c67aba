//! Modbus protocol limits and function codes

/// Maximum PDU size (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// Session header length (transaction id, protocol id, length)
pub const MBAP_HEADER_LEN: usize = 6;

/// Trailing CRC length
pub const CRC_LEN: usize = 2;

/// FC01/FC02 quantity limit
pub const MAX_BITS_PER_REQUEST: u16 = 2000;

/// FC03/FC04 quantity limit
pub const MAX_WORDS_PER_REQUEST: u16 = 125;

/// Largest frame a serial line may return (slave + PDU + CRC)
pub const MAX_RTU_FRAME: usize = 1 + MAX_PDU_SIZE + CRC_LEN;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception flag on the echoed function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Coil ON value for FC05
pub const COIL_ON: u16 = 0xFF00;

/// Bit-addressed read (coils, discrete inputs)
#[inline]
pub fn is_bit_function(fc: u8) -> bool {
    matches!(fc, FC_READ_COILS | FC_READ_DISCRETE_INPUTS)
}

/// Any of the four read function codes
#[inline]
pub fn is_read_function(fc: u8) -> bool {
    matches!(fc, FC_READ_COILS..=FC_READ_INPUT_REGISTERS)
}
