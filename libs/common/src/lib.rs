//! Shared plumbing for fieldlink services
//!
//! - logging setup
//! - layered configuration loading
//! - command-line arguments
//! - shutdown signals

pub mod args;
pub mod config;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use args::ServiceArgs;
pub use config::{load_config, load_config_from_file};
pub use logging::{LogConfig, LoggingConfig};

// Re-export common dependencies
pub use serde;
pub use serde_json;
pub use tokio;
