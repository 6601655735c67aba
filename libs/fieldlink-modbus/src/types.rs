//! Device and variable model
//!
//! These structures arrive already parsed from the management layer (or the
//! service configuration file). Field names follow the camelCase JSON schema
//! used by the device records.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use errors::{CollectError, CollectResult};
use serde::{Deserialize, Serialize};

use crate::constants::is_read_function;

// ============================================================================
// Transport
// ============================================================================

/// Supported Modbus transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Transport {
    /// MBAP header, no CRC
    #[serde(rename = "modbusTcp", alias = "tcp")]
    Tcp,
    /// Serial line, CRC, no header
    #[serde(rename = "modbusRtu", alias = "rtu")]
    Rtu,
    /// RTU frame (with CRC) carried behind an MBAP header over TCP
    #[serde(rename = "modbusRtuOverTcp", alias = "rtuOverTcp")]
    RtuOverTcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "modbusTcp",
            Self::Rtu => "modbusRtu",
            Self::RtuOverTcp => "modbusRtuOverTcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Memory layout
// ============================================================================

/// Byte/word order used to assemble multi-register values
///
/// ABCD notation, A being the most significant byte. For `0x12345678`:
/// - `BigEndian (ABCD)`: `[0x12, 0x34, 0x56, 0x78]`
/// - `LittleEndian (DCBA)`: `[0x78, 0x56, 0x34, 0x12]`
/// - `BigEndianSwap (CDAB)`: `[0x56, 0x78, 0x12, 0x34]`
/// - `LittleEndianSwap (BADC)`: `[0x34, 0x12, 0x78, 0x56]`
///
/// Single registers are read big-endian under ABCD/CDAB and
/// little-endian under BADC/DCBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    #[default]
    #[serde(rename = "ABCD")]
    BigEndian,
    #[serde(rename = "DCBA")]
    LittleEndian,
    #[serde(rename = "CDAB")]
    BigEndianSwap,
    #[serde(rename = "BADC")]
    LittleEndianSwap,
}

impl ByteOrder {
    /// Parse `ABCD`, `AB-CD`, `BE`, ... (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized = s.to_uppercase().replace('-', "");
        match normalized.as_str() {
            "ABCD" | "BE" | "BIG_ENDIAN" | "ABCDEFGH" => Some(Self::BigEndian),
            "DCBA" | "LE" | "LITTLE_ENDIAN" | "HGFEDCBA" => Some(Self::LittleEndian),
            "CDAB" | "BIG_ENDIAN_SWAP" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLE_ENDIAN_SWAP" => Some(Self::LittleEndianSwap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }

    /// Whether a single 16-bit register is read big-endian
    pub fn register_is_big_endian(&self) -> bool {
        matches!(self, Self::BigEndian | Self::BigEndianSwap)
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Variables
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DataType {
    /// Number of 16-bit registers occupied
    pub fn words(&self) -> u16 {
        match self {
            Self::Bool | Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Float32 => 2,
            Self::Int64 | Self::Float64 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    #[serde(rename = "r", alias = "readOnly")]
    ReadOnly,
    #[serde(rename = "rw", alias = "readWrite")]
    ReadWrite,
}

/// Decoded variable value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(b) => f64::from(u8::from(b)),
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::Float(f) => f != 0.0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One configured point on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub data_type: DataType,
    /// Register or coil address
    pub address: u16,
    /// Read function code, 1..=4
    pub function_code: u8,
    /// Bit inside a register, only for `bool` on FC03/FC04
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u8>,
    /// Scale factor; 0 and 1 leave the raw value untouched
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Last value decoded by a poll cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Variable {
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        function_code: u8,
        address: u16,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            address,
            function_code,
            bits: None,
            rate: 0.0,
            access_mode: AccessMode::ReadOnly,
            value: None,
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_bits(mut self, bits: u8) -> Self {
        self.bits = Some(bits);
        self
    }

    pub fn writable(mut self) -> Self {
        self.access_mode = AccessMode::ReadWrite;
        self
    }

    /// True when decode must multiply by `rate`
    pub fn is_scaled(&self) -> bool {
        self.rate != 0.0 && self.rate != 1.0
    }

    pub fn is_writable(&self) -> bool {
        self.access_mode == AccessMode::ReadWrite
    }
}

/// Name / type / value triple published for every decoded variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValue {
    pub name: String,
    pub data_type: DataType,
    pub value: Value,
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N", alias = "none")]
    None,
    #[serde(rename = "E", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

/// Transport-specific connection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressOption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_bits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity: Option<Parity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_bits: Option<u8>,
}

/// Host name / IP for TCP transports, serial device path for RTU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub location: String,
    #[serde(default)]
    pub option: AddressOption,
}

impl DeviceAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            location: host.into(),
            option: AddressOption {
                port: Some(port),
                ..Default::default()
            },
        }
    }

    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            location: path.into(),
            option: AddressOption {
                baud_rate: Some(baud_rate),
                ..Default::default()
            },
        }
    }
}

fn default_collector_cycle() -> u64 {
    1
}

fn default_slave() -> u8 {
    1
}

/// A polled field device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub device_model: Transport,
    /// Polling interval in seconds
    #[serde(default = "default_collector_cycle")]
    pub collector_cycle: u64,
    #[serde(default = "default_slave")]
    pub slave: u8,
    #[serde(default)]
    pub memory_layout: ByteOrder,
    /// Base address subtracted from every frame start on the wire
    #[serde(default)]
    pub position_address: u16,
    pub address: DeviceAddress,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Device {
    pub fn new(id: impl Into<String>, transport: Transport, address: DeviceAddress) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            device_model: transport,
            collector_cycle: default_collector_cycle(),
            slave: default_slave(),
            memory_layout: ByteOrder::default(),
            position_address: 0,
            address,
            variables: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_slave(mut self, slave: u8) -> Self {
        self.slave = slave;
        self
    }

    pub fn with_memory_layout(mut self, layout: ByteOrder) -> Self {
        self.memory_layout = layout;
        self
    }

    pub fn with_position_address(mut self, position: u16) -> Self {
        self.position_address = position;
        self
    }

    pub fn with_collector_cycle(mut self, secs: u64) -> Self {
        self.collector_cycle = secs;
        self
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Build the name → variable lookup; call once after construction
    pub fn index_variables(&mut self) {
        self.index = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.name.clone(), i))
            .collect();
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        match self.index.get(name) {
            Some(&i) => Some(i),
            // Not indexed yet
            None if self.index.len() != self.variables.len() => {
                self.variables.iter().position(|v| v.name == name)
            },
            None => None,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variable_index(name).map(|i| &self.variables[i])
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.collector_cycle)
    }

    /// Write decoded values back into the variables
    pub fn apply_values(&mut self, values: &[(usize, Value)]) {
        for (index, value) in values {
            if let Some(variable) = self.variables.get_mut(*index) {
                variable.value = Some(*value);
            }
        }
    }

    /// Static configuration checks
    pub fn validate(&self) -> CollectResult<()> {
        if self.id.trim().is_empty() {
            return Err(CollectError::invalid_config("id", "device id is empty"));
        }
        if self.collector_cycle == 0 {
            return Err(CollectError::invalid_config(
                format!("{}.collectorCycle", self.id),
                "must be positive",
            ));
        }
        if self.slave > 247 {
            return Err(CollectError::invalid_config(
                format!("{}.slave", self.id),
                format!("{} out of range 0..=247", self.slave),
            ));
        }
        if self.address.location.trim().is_empty() {
            return Err(CollectError::invalid_config(
                format!("{}.address.location", self.id),
                "location is empty",
            ));
        }
        match self.device_model {
            Transport::Tcp | Transport::RtuOverTcp if self.address.option.port.is_none() => {
                return Err(CollectError::invalid_config(
                    format!("{}.address.option.port", self.id),
                    "port is required for TCP transports",
                ));
            },
            Transport::Rtu if self.address.option.baud_rate.is_none() => {
                return Err(CollectError::invalid_config(
                    format!("{}.address.option.baudRate", self.id),
                    "baud rate is required for serial transport",
                ));
            },
            _ => {},
        }

        let mut seen = std::collections::HashSet::new();
        for variable in &self.variables {
            if variable.name.is_empty() {
                return Err(CollectError::invalid_config(
                    format!("{}.variables", self.id),
                    "variable name is empty",
                ));
            }
            if !seen.insert(variable.name.as_str()) {
                return Err(CollectError::invalid_config(
                    format!("{}.variables.{}", self.id, variable.name),
                    "duplicate variable name",
                ));
            }
            if !is_read_function(variable.function_code) {
                return Err(CollectError::invalid_config(
                    format!("{}.variables.{}.functionCode", self.id, variable.name),
                    format!("FC{:02} is not a read function", variable.function_code),
                ));
            }
            if let Some(bit) = variable.bits {
                if bit > 15 {
                    return Err(CollectError::invalid_config(
                        format!("{}.variables.{}.bits", self.id, variable.name),
                        format!("bit {} out of range 0..=15", bit),
                    ));
                }
            }
        }

        Ok(())
    }
}
