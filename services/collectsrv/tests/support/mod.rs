//! Shared test fixtures: a scripted in-memory Modbus device
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use collectsrv::{CollectorConfig, Connector, TransportRegistry};
use errors::{CollectError, CollectResult};
use fieldlink_modbus::{
    DataType, Device, DeviceAddress, Messenger, MessengerFactory, Transport, Variable,
};
use parking_lot::Mutex;

/// Register and coil image of a simulated slave, plus failure knobs
pub struct SimDevice {
    pub transport: Transport,
    pub registers: Mutex<BTreeMap<u16, u16>>,
    pub coils: Mutex<BTreeMap<u16, bool>>,
    pub reachable: AtomicBool,
    /// Asks that fail with a bad connection before the device answers
    pub fail_asks: AtomicUsize,
    /// Answers sent with a wrong slave id
    pub wrong_slave: AtomicUsize,
    /// Answers replaced by an exception
    pub exceptions: AtomicUsize,
    pub connects: AtomicUsize,
    pub asks: AtomicUsize,
}

impl SimDevice {
    pub fn new(transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registers: Mutex::new(BTreeMap::new()),
            coils: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
            fail_asks: AtomicUsize::new(0),
            wrong_slave: AtomicUsize::new(0),
            exceptions: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            asks: AtomicUsize::new(0),
        })
    }

    /// Preloaded with the values `sample_device` expects
    pub fn with_sample_image(transport: Transport) -> Arc<Self> {
        let sim = Self::new(transport);
        sim.set_register(10, (-10i16) as u16);
        sim.set_register(11, 500);
        sim.set_f32(14, 12.5);
        sim.set_register(20, 7);
        sim.coils.lock().insert(0, true);
        sim
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.registers.lock().insert(address, value);
    }

    pub fn register(&self, address: u16) -> u16 {
        self.registers.lock().get(&address).copied().unwrap_or(0)
    }

    pub fn coil(&self, address: u16) -> bool {
        self.coils.lock().get(&address).copied().unwrap_or(false)
    }

    /// Big-endian word order (ABCD)
    pub fn set_f32(&self, address: u16, value: f32) {
        let bits = value.to_bits();
        self.set_register(address, (bits >> 16) as u16);
        self.set_register(address + 1, bits as u16);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Answer one encoded request the way a real slave would
    pub fn respond(&self, request: &[u8]) -> Vec<u8> {
        let header = if self.transport.has_header() { 6 } else { 0 };
        let crc = if self.transport.has_crc() { 2 } else { 0 };
        let txn = if header > 0 {
            u16::from_be_bytes([request[0], request[1]])
        } else {
            0
        };
        let mut slave = request[header];
        let pdu = &request[header + 1..request.len() - crc];

        let reply = if take(&self.exceptions) {
            vec![pdu[0] | 0x80, 0x02]
        } else {
            self.execute(pdu)
        };
        if take(&self.wrong_slave) {
            slave = slave.wrapping_add(1);
        }
        self.transport.encode(txn, slave, &reply)
    }

    fn execute(&self, pdu: &[u8]) -> Vec<u8> {
        let fc = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let word = u16::from_be_bytes([pdu[3], pdu[4]]);

        match fc {
            0x01 | 0x02 => {
                let coils = self.coils.lock();
                let mut packed = vec![0u8; usize::from(word).div_ceil(8)];
                for i in 0..word {
                    if coils.get(&(address + i)).copied().unwrap_or(false) {
                        packed[usize::from(i / 8)] |= 1 << (i % 8);
                    }
                }
                let mut out = vec![fc, packed.len() as u8];
                out.extend(packed);
                out
            },
            0x03 | 0x04 => {
                let registers = self.registers.lock();
                let mut out = vec![fc, (word * 2) as u8];
                for i in 0..word {
                    let value = registers.get(&(address + i)).copied().unwrap_or(0);
                    out.extend(value.to_be_bytes());
                }
                out
            },
            0x05 => {
                self.coils.lock().insert(address, word == 0xFF00);
                pdu.to_vec()
            },
            0x06 => {
                self.set_register(address, word);
                pdu.to_vec()
            },
            0x10 => {
                let mut registers = self.registers.lock();
                for i in 0..word {
                    let at = 6 + usize::from(i) * 2;
                    registers.insert(address + i, u16::from_be_bytes([pdu[at], pdu[at + 1]]));
                }
                pdu[..5].to_vec()
            },
            _ => vec![fc | 0x80, 0x01],
        }
    }
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct SimMessenger {
    sim: Arc<SimDevice>,
    open: bool,
}

#[async_trait]
impl Messenger for SimMessenger {
    async fn ask(&mut self, request: &[u8], _expected_len: usize) -> CollectResult<Vec<u8>> {
        self.sim.asks.fetch_add(1, Ordering::SeqCst);
        if !self.open {
            return Err(CollectError::bad_connection("messenger closed"));
        }
        if take(&self.sim.fail_asks) {
            return Err(CollectError::bad_connection("connection reset by peer"));
        }
        Ok(self.sim.respond(request))
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

pub struct SimFactory {
    sim: Arc<SimDevice>,
}

#[async_trait]
impl MessengerFactory for SimFactory {
    async fn connect(&self) -> CollectResult<Box<dyn Messenger>> {
        if !self.sim.reachable.load(Ordering::SeqCst) {
            return Err(CollectError::connect_failure("simulated device unreachable"));
        }
        self.sim.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimMessenger {
            sim: Arc::clone(&self.sim),
            open: true,
        }))
    }

    fn endpoint(&self) -> String {
        format!("sim:{}", self.sim.transport)
    }
}

pub struct SimConnector {
    pub sim: Arc<SimDevice>,
}

impl Connector for SimConnector {
    fn factory(&self, _device: &Device) -> CollectResult<Arc<dyn MessengerFactory>> {
        Ok(Arc::new(SimFactory {
            sim: Arc::clone(&self.sim),
        }))
    }
}

pub fn sim_factory(sim: &Arc<SimDevice>) -> Arc<dyn MessengerFactory> {
    Arc::new(SimFactory {
        sim: Arc::clone(sim),
    })
}

/// Every transport served by `sim`
pub fn sim_registry(sim: &Arc<SimDevice>) -> TransportRegistry {
    let connector: Arc<dyn Connector> = Arc::new(SimConnector {
        sim: Arc::clone(sim),
    });
    TransportRegistry::new()
        .with(Transport::Tcp, Arc::clone(&connector))
        .with(Transport::Rtu, Arc::clone(&connector))
        .with(Transport::RtuOverTcp, connector)
}

/// Heartbeat effectively off; tests drive it through `heartbeat_once`
pub fn test_config() -> CollectorConfig {
    CollectorConfig {
        heartbeat_interval_secs: 3600,
        io_timeout_ms: 200,
        ..CollectorConfig::default()
    }
}

pub fn address_for(transport: Transport) -> DeviceAddress {
    match transport {
        Transport::Rtu => DeviceAddress::serial("/dev/ttySIM0", 9600),
        _ => DeviceAddress::tcp("127.0.0.1", 1502),
    }
}

/// Holding registers 10/11/14 (int16, uint16, float32), writable setpoint
/// at 20, writable coil 0
pub fn sample_device(id: &str, transport: Transport) -> Device {
    Device::new(id, transport, address_for(transport))
        .with_variable(Variable::new("temperature", DataType::Int16, 0x03, 10))
        .with_variable(Variable::new("pressure", DataType::Uint16, 0x03, 11))
        .with_variable(Variable::new("flow", DataType::Float32, 0x03, 14))
        .with_variable(Variable::new("setpoint", DataType::Int16, 0x03, 20).writable())
        .with_variable(Variable::new("running", DataType::Bool, 0x01, 0).writable())
}

/// Three holding registers in one frame
pub fn register_device(id: &str, transport: Transport) -> Device {
    Device::new(id, transport, address_for(transport))
        .with_variable(Variable::new("temperature", DataType::Int16, 0x03, 10))
        .with_variable(Variable::new("pressure", DataType::Uint16, 0x03, 11))
        .with_variable(Variable::new("flow", DataType::Float32, 0x03, 14))
}

/// Poll `check` until it holds or the timeout expires
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
