//! Modbus acquisition core for fieldlink
//!
//! Covers the three supported transports (TCP, RTU, RTU over TCP):
//! - framing, CRC and ordered response validation
//! - packing a device's variables into the fewest read requests
//! - value decoding / write encoding under the four memory layouts
//! - messengers (one live connection each) and the per-device pool
//!
//! ```text
//! fieldlink-modbus
//!     ├── types      (Device, Variable, Transport, ByteOrder, Value)
//!     ├── transport  (header / CRC envelope, response validation)
//!     ├── pdu        (PDU buffer + builder)
//!     ├── bytes      (memory-layout reordering)
//!     ├── codec      (payload → values, action → write PDU)
//!     ├── frame      (frame packer, RequestFrame)
//!     ├── messenger  (TCP / serial messengers and factories)
//!     └── pool       (ConnectionPool)
//! ```

pub mod bytes;
pub mod codec;
pub mod constants;
pub mod frame;
pub mod messenger;
pub mod pdu;
pub mod pool;
pub mod transport;
pub mod types;

pub use codec::{decode_frame, encode_write, WriteRequest};
pub use frame::{pack_frames, RequestFrame, VariableSlot};
pub use messenger::{
    Messenger, MessengerFactory, SerialMessengerFactory, SerialParams, TcpMessengerFactory,
};
pub use pdu::{ModbusPdu, PduBuilder};
pub use pool::ConnectionPool;
pub use types::{
    AccessMode, ByteOrder, DataType, Device, DeviceAddress, AddressOption, Parity, Transport,
    Value, Variable, VariableValue,
};
