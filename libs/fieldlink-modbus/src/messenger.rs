//! Messengers: one live transport connection each
//!
//! A messenger sends one request and reads one complete response. Every I/O
//! failure or timeout surfaces as `BadConnection`; the caller then closes
//! the messenger and asks its factory for a replacement.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::hex::format_frame;
use errors::{CollectError, CollectResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

use crate::constants::{MAX_PDU_SIZE, MAX_RTU_FRAME, MBAP_HEADER_LEN};
use crate::types::{DeviceAddress, Parity};

/// Serial frame end: silence after at least this many bytes
const RTU_MIN_FRAME: usize = 5;
const RTU_INTER_BYTE_GAP: Duration = Duration::from_millis(50);

/// Largest header length field: slave + PDU + CRC
const MAX_HEADER_LENGTH: usize = 1 + MAX_PDU_SIZE + 2;

#[async_trait]
pub trait Messenger: Send {
    /// Send `request` and return the complete response
    ///
    /// `expected_len` is the full response length for a successful answer;
    /// exception answers are shorter.
    async fn ask(&mut self, request: &[u8], expected_len: usize) -> CollectResult<Vec<u8>>;

    /// Shut the connection down; later `ask` calls fail
    async fn close(&mut self);
}

/// Opens new messengers for one device
#[async_trait]
pub trait MessengerFactory: Send + Sync {
    async fn connect(&self) -> CollectResult<Box<dyn Messenger>>;

    /// Endpoint for log lines
    fn endpoint(&self) -> String;
}

// ============================================================================
// TCP
// ============================================================================

/// Header-framed messenger (`Tcp`, `RtuOverTcp`)
pub struct TcpMessenger {
    stream: Option<TcpStream>,
    peer: String,
    io_timeout: Duration,
}

impl TcpMessenger {
    pub fn new(stream: TcpStream, peer: String, io_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            peer,
            io_timeout,
        }
    }
}

fn bad(peer: &str, what: &str, detail: impl std::fmt::Display) -> CollectError {
    CollectError::bad_connection(format!("{peer}: {what}: {detail}"))
}

#[async_trait]
impl Messenger for TcpMessenger {
    async fn ask(&mut self, request: &[u8], _expected_len: usize) -> CollectResult<Vec<u8>> {
        let peer = self.peer.as_str();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| bad(peer, "send", "connection closed"))?;

        // 1. Send
        match timeout(self.io_timeout, stream.write_all(request)).await {
            Ok(Ok(())) => trace!("TCP TX {}: {}", peer, format_frame(request)),
            Ok(Err(e)) => return Err(bad(peer, "send", e)),
            Err(_) => return Err(bad(peer, "send", "timeout")),
        }

        // 2. Header
        let mut header = [0u8; MBAP_HEADER_LEN];
        match timeout(self.io_timeout, stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(bad(peer, "header", e)),
            Err(_) => return Err(bad(peer, "header", "timeout")),
        }

        // 3. Remaining length
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        if length == 0 || length > MAX_HEADER_LENGTH {
            // Stream is out of sync; force a reconnect
            return Err(bad(peer, "header", format!("invalid length {length}")));
        }

        let mut response = vec![0u8; MBAP_HEADER_LEN + length];
        response[..MBAP_HEADER_LEN].copy_from_slice(&header);
        match timeout(
            self.io_timeout,
            stream.read_exact(&mut response[MBAP_HEADER_LEN..]),
        )
        .await
        {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(bad(peer, "body", e)),
            Err(_) => return Err(bad(peer, "body", "timeout")),
        }

        trace!("TCP RX {}: {}", peer, format_frame(&response));
        Ok(response)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("TCP closed: {}", self.peer);
        }
    }
}

pub struct TcpMessengerFactory {
    addr: String,
    io_timeout: Duration,
}

impl TcpMessengerFactory {
    pub fn new(host: &str, port: u16, io_timeout: Duration) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            io_timeout,
        }
    }

    pub fn from_address(address: &DeviceAddress, io_timeout: Duration) -> CollectResult<Self> {
        let port = address.option.port.ok_or_else(|| {
            CollectError::invalid_config("address.option.port", "port is required")
        })?;
        Ok(Self::new(&address.location, port, io_timeout))
    }
}

#[async_trait]
impl MessengerFactory for TcpMessengerFactory {
    async fn connect(&self) -> CollectResult<Box<dyn Messenger>> {
        debug!("TCP connecting: {}", self.addr);
        match timeout(self.io_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", self.addr);
                Ok(Box::new(TcpMessenger::new(
                    stream,
                    self.addr.clone(),
                    self.io_timeout,
                )))
            },
            Ok(Err(e)) => {
                warn!("TCP err: {} - {}", self.addr, e);
                Err(CollectError::connect_failure(format!(
                    "Failed to connect to {}: {}",
                    self.addr, e
                )))
            },
            Err(_) => {
                warn!("TCP timeout: {}", self.addr);
                Err(CollectError::connect_failure(format!(
                    "Connection to {} timed out",
                    self.addr
                )))
            },
        }
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}

// ============================================================================
// Serial
// ============================================================================

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialParams {
    /// Defaults to 8N1 when the device leaves options out
    pub fn from_address(address: &DeviceAddress) -> CollectResult<Self> {
        let baud_rate = address.option.baud_rate.ok_or_else(|| {
            CollectError::invalid_config("address.option.baudRate", "baud rate is required")
        })?;
        Ok(Self {
            path: address.location.clone(),
            baud_rate,
            data_bits: address.option.data_bits.unwrap_or(8),
            parity: address.option.parity.unwrap_or(Parity::None),
            stop_bits: address.option.stop_bits.unwrap_or(1),
        })
    }
}

/// Serial RTU messenger; one per line
pub struct SerialMessenger {
    port: Option<SerialStream>,
    path: String,
    io_timeout: Duration,
}

#[async_trait]
impl Messenger for SerialMessenger {
    async fn ask(&mut self, request: &[u8], expected_len: usize) -> CollectResult<Vec<u8>> {
        let path = self.path.as_str();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| bad(path, "send", "port closed"))?;

        port.write_all(request)
            .await
            .map_err(|e| bad(path, "send", e))?;
        port.flush().await.map_err(|e| bad(path, "flush", e))?;
        trace!("RTU TX {}: {}", path, format_frame(request));

        let want = expected_len.min(MAX_RTU_FRAME);
        let mut buffer = vec![0u8; MAX_RTU_FRAME];
        let mut total = 0;
        let started = Instant::now();

        // Read until the expected length arrives or the line goes quiet
        while total < want {
            let remaining = self.io_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(bad(path, "read", format!("timeout after {total}B")));
            }
            let wait = if total >= RTU_MIN_FRAME {
                RTU_INTER_BYTE_GAP.min(remaining)
            } else {
                remaining
            };

            match timeout(wait, port.read(&mut buffer[total..])).await {
                Ok(Ok(0)) => {
                    error!("RTU closed: {}", path);
                    return Err(bad(path, "read", "port closed"));
                },
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => return Err(bad(path, "read", e)),
                Err(_) if total >= RTU_MIN_FRAME => break,
                Err(_) => {
                    return Err(bad(path, "read", format!("timeout after {total}B")));
                },
            }
        }

        buffer.truncate(total);
        trace!("RTU RX {}: {}", path, format_frame(&buffer));
        Ok(buffer)
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("RTU closed: {}", self.path);
        }
    }
}

pub struct SerialMessengerFactory {
    params: SerialParams,
    io_timeout: Duration,
}

impl SerialMessengerFactory {
    pub fn new(params: SerialParams, io_timeout: Duration) -> Self {
        Self { params, io_timeout }
    }
}

#[async_trait]
impl MessengerFactory for SerialMessengerFactory {
    async fn connect(&self) -> CollectResult<Box<dyn Messenger>> {
        let p = &self.params;
        debug!("RTU: {} @{}baud", p.path, p.baud_rate);

        let parity = match p.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let data_bits = match p.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match p.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        match tokio_serial::new(&p.path, p.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(self.io_timeout)
            .open_native_async()
        {
            Ok(port) => {
                info!("RTU opened: {}", p.path);
                Ok(Box::new(SerialMessenger {
                    port: Some(port),
                    path: p.path.clone(),
                    io_timeout: self.io_timeout,
                }))
            },
            Err(e) => {
                warn!("RTU err: {} - {}", p.path, e);
                Err(CollectError::connect_failure(format!(
                    "Failed to open serial port {}: {}",
                    p.path, e
                )))
            },
        }
    }

    fn endpoint(&self) -> String {
        self.params.path.clone()
    }
}
