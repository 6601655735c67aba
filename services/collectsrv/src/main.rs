//! Collection service entry point

use clap::Parser;
use common::logging::{init_with_config, LogConfig};
use common::shutdown::wait_for_shutdown;
use common::ServiceArgs;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use collectsrv::{CollectsrvConfig, DeviceManager, TransportRegistry, SERVICE_NAME};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServiceArgs::parse();
    let config = CollectsrvConfig::load(args.config.as_deref())?;

    let mut log_config = LogConfig::new(SERVICE_NAME)
        .with_settings(&config.logging)
        .with_ansi(!args.no_color);
    if let Some(level) = &args.log_level {
        log_config = log_config.with_level(level.clone());
    }
    init_with_config(log_config).map_err(|e| anyhow::anyhow!("Failed to init logging: {e}"))?;

    config.validate()?;
    if args.validate {
        info!("Configuration valid: {} devices", config.devices.len());
        return Ok(());
    }

    #[cfg(unix)]
    spawn_log_reload(args.config.clone());

    let registry = TransportRegistry::with_defaults(config.collector.io_timeout());
    let manager = DeviceManager::new(registry, &config.collector)?;

    let mut results = manager.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match results.recv().await {
                Ok(result) => debug!(
                    "Dev{}: {} values, {} errors",
                    result.device_id,
                    result.variables.len(),
                    result.errors.len()
                ),
                Err(RecvError::Lagged(skipped)) => warn!("Result log lagged by {}", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = manager.start(config.devices).await {
        warn!("Some devices failed to register: {}", e);
    }
    for (id, state) in manager.list_devices() {
        info!("Dev{}: {}", id, state);
    }

    wait_for_shutdown().await;
    info!("Shutdown signal received");

    manager.shutdown().await;
    printer.abort();
    Ok(())
}

/// Re-apply `logging.level` from the configuration file on SIGHUP
#[cfg(unix)]
fn spawn_log_reload(config_path: Option<std::path::PathBuf>) {
    use common::logging::get_log_level;
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("SIGHUP handler: {}, log level reload disabled", e);
            return;
        },
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let previous = get_log_level();
            match CollectsrvConfig::reload_log_level(config_path.as_deref()) {
                Ok(level) => info!("Log level reloaded: {} -> {}", previous, level),
                Err(e) => warn!("Log level reload failed, keeping {}: {}", previous, e),
            }
        }
    });
}
