//! Field-device collection service
//!
//! ```text
//! DeviceManager ──ready──► Broker ──► ConnectionPool ──► Messenger
//!      ▲                     │
//!      └──── CycleResult ◄───┘
//! ```
//!
//! The manager owns the registry and lifecycle, brokers poll one device
//! each, and the transport registry decides how a device is reached.

pub mod broker;
pub mod config;
pub mod manager;
pub mod registry;
pub mod state;

pub use broker::{Broker, BrokerSettings, CycleResult, SharedDevice};
pub use config::{CollectorConfig, CollectsrvConfig, SERVICE_NAME};
pub use manager::{parse_actions, DeviceManager, DeviceSnapshot};
pub use registry::{Connector, SerialConnector, TcpConnector, TransportRegistry};
pub use state::{ControlEvent, DeviceState, Transition};
