//! Transport registry
//!
//! Maps each supported transport to the connector that builds messenger
//! factories for it. Built once at startup and handed to the manager.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use errors::{CollectError, CollectResult};
use fieldlink_modbus::{
    Device, MessengerFactory, SerialMessengerFactory, SerialParams, TcpMessengerFactory, Transport,
};

/// Turns a device address into a messenger factory
pub trait Connector: Send + Sync {
    fn factory(&self, device: &Device) -> CollectResult<Arc<dyn MessengerFactory>>;
}

/// TCP socket connector, used for `Tcp` and `RtuOverTcp`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    io_timeout: Duration,
}

impl TcpConnector {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

impl Connector for TcpConnector {
    fn factory(&self, device: &Device) -> CollectResult<Arc<dyn MessengerFactory>> {
        let factory = TcpMessengerFactory::from_address(&device.address, self.io_timeout)?;
        Ok(Arc::new(factory))
    }
}

/// Serial line connector, used for `Rtu`
#[derive(Debug, Clone)]
pub struct SerialConnector {
    io_timeout: Duration,
}

impl SerialConnector {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

impl Connector for SerialConnector {
    fn factory(&self, device: &Device) -> CollectResult<Arc<dyn MessengerFactory>> {
        let params = SerialParams::from_address(&device.address)?;
        Ok(Arc::new(SerialMessengerFactory::new(params, self.io_timeout)))
    }
}

#[derive(Clone, Default)]
pub struct TransportRegistry {
    connectors: BTreeMap<Transport, Arc<dyn Connector>>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("transports", &self.transports())
            .finish()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// TCP connector for `Tcp` / `RtuOverTcp`, serial connector for `Rtu`
    pub fn with_defaults(io_timeout: Duration) -> Self {
        let tcp: Arc<dyn Connector> = Arc::new(TcpConnector::new(io_timeout));
        Self::new()
            .with(Transport::Tcp, tcp.clone())
            .with(Transport::RtuOverTcp, tcp)
            .with(Transport::Rtu, Arc::new(SerialConnector::new(io_timeout)))
    }

    pub fn with(mut self, transport: Transport, connector: Arc<dyn Connector>) -> Self {
        self.register(transport, connector);
        self
    }

    pub fn register(&mut self, transport: Transport, connector: Arc<dyn Connector>) {
        self.connectors.insert(transport, connector);
    }

    pub fn transports(&self) -> Vec<Transport> {
        self.connectors.keys().copied().collect()
    }

    /// Messenger factory for `device`; unknown transports are unsupported
    pub fn factory_for(&self, device: &Device) -> CollectResult<Arc<dyn MessengerFactory>> {
        let connector = self.connectors.get(&device.device_model).ok_or_else(|| {
            CollectError::UnsupportedDeviceType(device.device_model.as_str().to_string())
        })?;
        connector.factory(device)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use fieldlink_modbus::DeviceAddress;

    #[test]
    fn test_defaults_cover_every_transport() {
        let registry = TransportRegistry::with_defaults(Duration::from_millis(100));
        assert_eq!(
            registry.transports(),
            vec![Transport::Tcp, Transport::Rtu, Transport::RtuOverTcp]
        );

        let device = Device::new("d1", Transport::Tcp, DeviceAddress::tcp("127.0.0.1", 502));
        let factory = registry.factory_for(&device).unwrap();
        assert_eq!(factory.endpoint(), "127.0.0.1:502");

        let serial = Device::new("d2", Transport::Rtu, DeviceAddress::serial("/dev/ttyUSB0", 9600));
        assert_eq!(registry.factory_for(&serial).unwrap().endpoint(), "/dev/ttyUSB0");
    }

    #[test]
    fn test_missing_connector_is_unsupported() {
        let registry = TransportRegistry::new()
            .with(Transport::Tcp, Arc::new(TcpConnector::new(Duration::from_millis(100))));
        let device = Device::new("d1", Transport::Rtu, DeviceAddress::serial("/dev/ttyS0", 9600));
        assert!(matches!(
            registry.factory_for(&device),
            Err(CollectError::UnsupportedDeviceType(_))
        ));
    }

    #[test]
    fn test_tcp_without_port_is_invalid() {
        let registry = TransportRegistry::with_defaults(Duration::from_millis(100));
        let device = Device::new("d1", Transport::Tcp, DeviceAddress::serial("10.0.0.1", 9600));
        assert!(matches!(
            registry.factory_for(&device),
            Err(CollectError::InvalidConfig { .. })
        ));
    }
}
