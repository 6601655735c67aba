//! Transport envelopes and ordered response validation
//!
//! | Transport    | Header (txn, proto, len) | CRC16 |
//! |--------------|--------------------------|-------|
//! | `Tcp`        | yes                      | no    |
//! | `Rtu`        | no                       | yes   |
//! | `RtuOverTcp` | yes                      | yes   |
//!
//! The header length field counts every byte after the header, CRC
//! included. The CRC covers slave id + PDU, never the header.

use errors::{CollectError, CollectResult};
use tracing::debug;

use crate::constants::{is_bit_function, CRC_LEN, EXCEPTION_FLAG, MBAP_HEADER_LEN};
use crate::types::Transport;

/// Body bytes of a write echo: slave, fc, address, value/quantity
const WRITE_ECHO_LEN: usize = 6;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub fn calculate_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

impl Transport {
    pub fn has_header(&self) -> bool {
        matches!(self, Self::Tcp | Self::RtuOverTcp)
    }

    pub fn has_crc(&self) -> bool {
        matches!(self, Self::Rtu | Self::RtuOverTcp)
    }

    fn header_len(&self) -> usize {
        if self.has_header() {
            MBAP_HEADER_LEN
        } else {
            0
        }
    }

    fn crc_len(&self) -> usize {
        if self.has_crc() {
            CRC_LEN
        } else {
            0
        }
    }

    /// Bytes of a read response that are not payload
    /// (header, slave, fc, byte count, CRC)
    pub fn non_data_len(&self) -> usize {
        self.header_len() + 3 + self.crc_len()
    }

    /// Full length of a read response carrying `quantity` bits or registers
    pub fn expected_read_len(&self, function_code: u8, quantity: u16) -> usize {
        let payload = if is_bit_function(function_code) {
            usize::from(quantity).div_ceil(8)
        } else {
            usize::from(quantity) * 2
        };
        payload + self.non_data_len()
    }

    /// Full length of a FC05/06/16 echo
    pub fn expected_write_len(&self) -> usize {
        self.header_len() + WRITE_ECHO_LEN + self.crc_len()
    }

    /// Connections to keep for a device served by `frames` frames
    pub fn pool_size(&self, frames: usize) -> usize {
        match self {
            Self::Tcp | Self::RtuOverTcp => frames / 5 + 1,
            Self::Rtu => 1,
        }
    }

    /// Wrap a PDU in this transport's envelope
    pub fn encode(&self, transaction_id: u16, slave: u8, pdu: &[u8]) -> Vec<u8> {
        let body_len = 1 + pdu.len() + self.crc_len();
        let mut frame = Vec::with_capacity(self.header_len() + body_len);

        if self.has_header() {
            frame.extend_from_slice(&transaction_id.to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&(body_len as u16).to_be_bytes());
        }
        let body_start = frame.len();
        frame.push(slave);
        frame.extend_from_slice(pdu);
        if self.has_crc() {
            let crc = calculate_crc16(&frame[body_start..]);
            frame.extend_from_slice(&crc.to_le_bytes());
        }
        frame
    }

    /// Overwrite the transaction id of an encoded frame
    pub fn stamp_transaction_id(&self, frame: &mut [u8], transaction_id: u16) {
        if self.has_header() && frame.len() >= 2 {
            frame[..2].copy_from_slice(&transaction_id.to_be_bytes());
        }
    }

    /// Transaction id, header strip, slave id and exception bit
    fn check_envelope<'a>(
        &self,
        buf: &'a [u8],
        transaction_id: u16,
        slave: u8,
    ) -> CollectResult<&'a [u8]> {
        let body = if self.has_header() {
            if buf.len() < MBAP_HEADER_LEN {
                return Err(CollectError::InsufficientResponseLength {
                    expected: MBAP_HEADER_LEN,
                    actual: buf.len(),
                });
            }
            let actual = u16::from_be_bytes([buf[0], buf[1]]);
            if actual != transaction_id {
                return Err(CollectError::TransactionMismatch {
                    expected: transaction_id,
                    actual,
                });
            }
            &buf[MBAP_HEADER_LEN..]
        } else {
            buf
        };

        if body.len() < 2 {
            return Err(CollectError::InsufficientResponseLength {
                expected: 2,
                actual: body.len(),
            });
        }
        if body[0] != slave {
            return Err(CollectError::SlaveMismatch {
                expected: slave,
                actual: body[0],
            });
        }
        if body[1] & EXCEPTION_FLAG != 0 {
            let exception_code = body.get(2).copied().unwrap_or(0);
            debug!(
                "Exception FC{:02X} code {:02X}",
                body[1] & !EXCEPTION_FLAG,
                exception_code
            );
            return Err(CollectError::DeviceReportedFunctionError {
                function_code: body[1] & !EXCEPTION_FLAG,
                exception_code,
            });
        }
        Ok(body)
    }

    fn check_crc(&self, body: &[u8], covered: usize) -> CollectResult<()> {
        if !self.has_crc() {
            return Ok(());
        }
        let expected = calculate_crc16(&body[..covered]);
        let actual = u16::from_le_bytes([body[covered], body[covered + 1]]);
        if expected != actual {
            return Err(CollectError::ChecksumError { expected, actual });
        }
        Ok(())
    }

    /// Validate a FC01-04 response and return its payload
    ///
    /// Checks run in order: transaction id, slave id, exception bit,
    /// function code echo, byte count, CRC.
    pub fn validate_read_response<'a>(
        &self,
        buf: &'a [u8],
        transaction_id: u16,
        slave: u8,
        function_code: u8,
    ) -> CollectResult<&'a [u8]> {
        let body = self.check_envelope(buf, transaction_id, slave)?;
        if body[1] != function_code {
            return Err(CollectError::protocol(format!(
                "function code mismatch: sent FC{:02X}, got FC{:02X}",
                function_code, body[1]
            )));
        }
        if body.len() < 3 {
            return Err(CollectError::InsufficientResponseLength {
                expected: 3 + self.crc_len(),
                actual: body.len(),
            });
        }

        let byte_len = usize::from(body[2]);
        let expected = byte_len + 3 + self.crc_len();
        if body.len() != expected {
            return Err(CollectError::InsufficientResponseLength {
                expected,
                actual: body.len(),
            });
        }
        self.check_crc(body, byte_len + 3)?;

        Ok(&body[3..3 + byte_len])
    }

    /// Validate a FC05/06/16 echo
    pub fn validate_write_response(
        &self,
        buf: &[u8],
        transaction_id: u16,
        slave: u8,
        function_code: u8,
    ) -> CollectResult<()> {
        let body = self.check_envelope(buf, transaction_id, slave)?;
        if body[1] != function_code {
            return Err(CollectError::protocol(format!(
                "function code mismatch: sent FC{:02X}, got FC{:02X}",
                function_code, body[1]
            )));
        }
        let expected = WRITE_ECHO_LEN + self.crc_len();
        if body.len() != expected {
            return Err(CollectError::InsufficientResponseLength {
                expected,
                actual: body.len(),
            });
        }
        self.check_crc(body, WRITE_ECHO_LEN)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const READ_HOLDING: [u8; 5] = [0x03, 0x00, 0x00, 0x00, 0x0A];

    #[test]
    fn test_crc_known_vector() {
        // 01 03 00 00 00 0A → C5 CD on the wire
        let crc = calculate_crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(crc.to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn test_encode_envelopes() {
        let tcp = Transport::Tcp.encode(0x0001, 0x01, &READ_HOLDING);
        assert_eq!(
            tcp,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );

        let rtu = Transport::Rtu.encode(0x0001, 0x01, &READ_HOLDING);
        assert_eq!(rtu, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);

        let over_tcp = Transport::RtuOverTcp.encode(0x0102, 0x01, &READ_HOLDING);
        assert_eq!(&over_tcp[..6], &[0x01, 0x02, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(&over_tcp[6..], rtu.as_slice());
    }

    #[test]
    fn test_stamp_transaction_id() {
        let mut frame = Transport::Tcp.encode(1, 1, &READ_HOLDING);
        Transport::Tcp.stamp_transaction_id(&mut frame, 0xABCD);
        assert_eq!(&frame[..2], &[0xAB, 0xCD]);

        let mut rtu = Transport::Rtu.encode(1, 1, &READ_HOLDING);
        let before = rtu.clone();
        Transport::Rtu.stamp_transaction_id(&mut rtu, 0xABCD);
        assert_eq!(rtu, before);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Transport::Tcp.non_data_len(), 9);
        assert_eq!(Transport::Rtu.non_data_len(), 5);
        assert_eq!(Transport::RtuOverTcp.non_data_len(), 11);
        assert_eq!(Transport::Tcp.expected_read_len(0x03, 10), 29);
        assert_eq!(Transport::Rtu.expected_read_len(0x01, 9), 7);
        assert_eq!(Transport::Rtu.expected_read_len(0x02, 16), 7);
        assert_eq!(Transport::Tcp.expected_write_len(), 12);
        assert_eq!(Transport::Rtu.expected_write_len(), 8);
        assert_eq!(Transport::Tcp.pool_size(0), 1);
        assert_eq!(Transport::Tcp.pool_size(12), 3);
        assert_eq!(Transport::Rtu.pool_size(12), 1);
    }

    fn rtu_response(slave: u8, fc: u8, payload: &[u8]) -> Vec<u8> {
        let mut pdu = vec![fc, payload.len() as u8];
        pdu.extend_from_slice(payload);
        Transport::Rtu.encode(0, slave, &pdu)
    }

    #[test]
    fn test_validate_read_ok() {
        let resp = rtu_response(0x01, 0x03, &[0x00, 0x2A, 0x01, 0x00]);
        let payload = Transport::Rtu
            .validate_read_response(&resp, 0, 0x01, 0x03)
            .unwrap();
        assert_eq!(payload, &[0x00, 0x2A, 0x01, 0x00]);

        let tcp = Transport::Tcp.encode(7, 0x02, &[0x04, 0x02, 0x12, 0x34]);
        assert_eq!(
            Transport::Tcp
                .validate_read_response(&tcp, 7, 0x02, 0x04)
                .unwrap(),
            &[0x12, 0x34]
        );
    }

    #[test]
    fn test_validate_read_order() {
        let tcp = Transport::RtuOverTcp.encode(7, 0x02, &[0x03, 0x02, 0x12, 0x34]);

        assert!(matches!(
            Transport::RtuOverTcp.validate_read_response(&tcp, 8, 0x09, 0x03),
            Err(CollectError::TransactionMismatch {
                expected: 8,
                actual: 7
            })
        ));
        assert!(matches!(
            Transport::RtuOverTcp.validate_read_response(&tcp, 7, 0x09, 0x03),
            Err(CollectError::SlaveMismatch {
                expected: 0x09,
                actual: 0x02
            })
        ));

        let exception = Transport::Rtu.encode(0, 0x01, &[0x83, 0x02]);
        assert_eq!(
            Transport::Rtu
                .validate_read_response(&exception, 0, 0x01, 0x03)
                .unwrap_err(),
            CollectError::DeviceReportedFunctionError {
                function_code: 0x03,
                exception_code: 0x02
            }
        );

        let mut short = rtu_response(0x01, 0x03, &[0x00, 0x2A]);
        short[2] = 0x04;
        assert!(matches!(
            Transport::Rtu.validate_read_response(&short, 0, 0x01, 0x03),
            Err(CollectError::InsufficientResponseLength {
                expected: 9,
                actual: 7
            })
        ));
    }

    #[test]
    fn test_any_flipped_byte_fails_crc() {
        let resp = rtu_response(0x01, 0x03, &[0x00, 0x2A, 0x01, 0x00]);
        // Bytes 3.. are payload: flipping them leaves every earlier check intact
        for i in 3..resp.len() - CRC_LEN {
            let mut corrupt = resp.clone();
            corrupt[i] ^= 0x5A;
            assert!(
                matches!(
                    Transport::Rtu.validate_read_response(&corrupt, 0, 0x01, 0x03),
                    Err(CollectError::ChecksumError { .. })
                ),
                "flip at {i} not detected"
            );
        }
    }

    #[test]
    fn test_validate_write_echo() {
        let echo = Transport::Rtu.encode(0, 0x01, &[0x06, 0x00, 0x10, 0x00, 0x2A]);
        Transport::Rtu
            .validate_write_response(&echo, 0, 0x01, 0x06)
            .unwrap();

        assert!(matches!(
            Transport::Rtu.validate_write_response(&echo, 0, 0x01, 0x10),
            Err(CollectError::Protocol(_))
        ));

        let tcp_echo = Transport::Tcp.encode(3, 0x01, &[0x05, 0x00, 0x01, 0xFF]);
        assert!(matches!(
            Transport::Tcp.validate_write_response(&tcp_echo, 3, 0x01, 0x05),
            Err(CollectError::InsufficientResponseLength { .. })
        ));
    }
}
