//! Device manager
//!
//! Owns the device registry and drives every device through its lifecycle:
//!
//! ```text
//!            ready ok                 cycle with errors
//!   ┌──────────────────► Collecting ◄──────────────────► CollectingError
//!   │                        │  stop                          │ stop
//!   │  connect failure       ▼                                ▼
//!   ├──────────────────► Unconnected ──(heartbeat)──► ready   Stopped
//!   │  no variables
//!   └──────────────────► EmptyVariable
//! ```
//!
//! Lifecycle work (readiness attempts, teardown) is serialized by one async
//! lock; the registry itself sits behind a short-lived sync mutex.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use errors::{CollectError, CollectResult};
use fieldlink_modbus::Device;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerSettings, CycleResult, SharedDevice};
use crate::config::CollectorConfig;
use crate::registry::TransportRegistry;
use crate::state::{ControlEvent, DeviceState, Transition};

struct DeviceEntry {
    device: SharedDevice,
    state: DeviceState,
    /// Bumped on every readiness attempt and teardown; stale result
    /// consumers compare against it and exit
    generation: u64,
}

#[derive(Default)]
struct Registry {
    devices: BTreeMap<String, DeviceEntry>,
    brokers: BTreeMap<String, Arc<Broker>>,
    /// Devices waiting for a heartbeat retry
    heartbeat: BTreeSet<String>,
}

#[derive(Debug)]
struct ControlRequest {
    device_id: String,
    event: ControlEvent,
}

/// Device configuration plus its current state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    #[serde(flatten)]
    pub device: Device,
    pub state: DeviceState,
}

struct ManagerInner {
    registry: Mutex<Registry>,
    transports: TransportRegistry,
    settings: BrokerSettings,
    heartbeat_interval: Duration,
    lifecycle: tokio::sync::Mutex<()>,
    control_tx: mpsc::Sender<ControlRequest>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlRequest>>>,
    results: broadcast::Sender<CycleResult>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; clones share one registry
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("DeviceManager")
            .field("devices", &registry.devices.len())
            .field("brokers", &registry.brokers.len())
            .field("heartbeat", &registry.heartbeat.len())
            .finish()
    }
}

impl DeviceManager {
    /// Build a manager; the collector settings are validated first
    pub fn new(transports: TransportRegistry, config: &CollectorConfig) -> CollectResult<Self> {
        config.validate()?;
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_capacity);
        let (results, _) = broadcast::channel(config.result_buffer);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(Registry::default()),
                transports,
                settings: BrokerSettings::from(config),
                heartbeat_interval: config.heartbeat_interval(),
                lifecycle: tokio::sync::Mutex::new(()),
                control_tx,
                control_rx: Mutex::new(Some(control_rx)),
                results,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the control and heartbeat tasks, then register `devices`
    ///
    /// Every device is attempted; registration failures are returned
    /// together.
    pub async fn start(&self, devices: Vec<Device>) -> CollectResult<()> {
        let control_rx = self
            .inner
            .control_rx
            .lock()
            .take()
            .ok_or_else(|| CollectError::internal("device manager already started"))?;

        let control = tokio::spawn(self.clone().run_control_queue(control_rx));
        let heartbeat = tokio::spawn(self.clone().run_heartbeat());
        self.inner.tasks.lock().extend([control, heartbeat]);

        info!(
            "Device manager started: {} devices, heartbeat {}s",
            devices.len(),
            self.inner.heartbeat_interval.as_secs()
        );

        let mut failures = Vec::new();
        for device in devices {
            let id = device.id.clone();
            if let Err(e) = self.add_device(device).await {
                error!("Dev{}: registration failed: {}", id, e);
                failures.push(e);
            }
        }
        CollectError::from_many(failures)
    }

    /// Register a device and attempt readiness
    pub async fn add_device(&self, mut device: Device) -> CollectResult<DeviceState> {
        device.validate()?;
        device.index_variables();
        let id = device.id.clone();

        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut registry = self.inner.registry.lock();
            if registry.devices.contains_key(&id) {
                return Err(CollectError::DeviceExists(id));
            }
            registry.devices.insert(
                id.clone(),
                DeviceEntry {
                    device: Arc::new(RwLock::new(device)),
                    state: DeviceState::Stopped,
                    generation: 0,
                },
            );
        }
        info!("Dev{}: registered", id);
        self.ready(&id).await
    }

    /// Tear down and forget a device
    pub async fn remove_device(&self, id: &str) -> CollectResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.registry.lock().devices.contains_key(id) {
            return Err(CollectError::DeviceNotFound(id.to_string()));
        }
        self.teardown(id).await;
        {
            let mut registry = self.inner.registry.lock();
            registry.devices.remove(id);
            registry.heartbeat.remove(id);
        }
        info!("Dev{}: removed", id);
        Ok(())
    }

    /// Queue a control event; it is applied by the control task
    pub async fn request_status_change(&self, id: &str, event: ControlEvent) -> CollectResult<()> {
        if !self.inner.registry.lock().devices.contains_key(id) {
            return Err(CollectError::DeviceNotFound(id.to_string()));
        }
        self.inner
            .control_tx
            .send(ControlRequest {
                device_id: id.to_string(),
                event,
            })
            .await
            .map_err(|_| CollectError::internal("control queue closed"))
    }

    /// Apply a control event now and return the resulting state
    pub async fn apply_control(&self, id: &str, event: ControlEvent) -> CollectResult<DeviceState> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self
            .device_state(id)
            .ok_or_else(|| CollectError::DeviceNotFound(id.to_string()))?;

        let next = match state.on_event(event) {
            Transition::Keep => state,
            Transition::Stop => {
                self.teardown(id).await;
                DeviceState::Stopped
            },
            Transition::Reconnect => {
                self.teardown(id).await;
                self.ready(id).await?
            },
        };
        info!("Dev{}: {} ({} -> {})", id, event, state, next);
        Ok(next)
    }

    /// Validate and dispatch a write action
    ///
    /// Name checks run first and are reported together; only a fully legal
    /// action reaches the device.
    pub async fn deliver_action(
        &self,
        id: &str,
        actions: &[(String, serde_json::Value)],
    ) -> CollectResult<()> {
        let (device, state, broker) = {
            let registry = self.inner.registry.lock();
            let entry = registry
                .devices
                .get(id)
                .ok_or_else(|| CollectError::DeviceNotFound(id.to_string()))?;
            (
                Arc::clone(&entry.device),
                entry.state,
                registry.brokers.get(id).cloned(),
            )
        };

        let mut problems = Vec::new();
        let mut legal = Vec::with_capacity(actions.len());
        {
            let device = device.read();
            let mut seen = HashSet::new();
            for (name, value) in actions {
                if !seen.insert(name.as_str()) {
                    problems.push(CollectError::DuplicateAction(name.clone()));
                    continue;
                }
                match device.variable(name) {
                    None => problems.push(CollectError::VariableNotFound(name.clone())),
                    Some(v) if !v.is_writable() => {
                        problems.push(CollectError::ReadOnlyVariable(name.clone()))
                    },
                    Some(_) => legal.push((name.clone(), value.clone())),
                }
            }
        }
        CollectError::from_many(problems)?;

        if legal.is_empty() {
            return Err(CollectError::NoLegalAction);
        }
        let broker = match broker {
            Some(broker) if state != DeviceState::Unconnected => broker,
            _ => return Err(CollectError::DeviceNotConnected(id.to_string())),
        };
        broker.deliver_action(&legal).await
    }

    pub fn device_state(&self, id: &str) -> Option<DeviceState> {
        self.inner.registry.lock().devices.get(id).map(|e| e.state)
    }

    /// Configuration, last values and state of one device
    pub fn device(&self, id: &str) -> Option<DeviceSnapshot> {
        let registry = self.inner.registry.lock();
        registry.devices.get(id).map(|entry| DeviceSnapshot {
            device: entry.device.read().clone(),
            state: entry.state,
        })
    }

    pub fn list_devices(&self) -> Vec<(String, DeviceState)> {
        self.inner
            .registry
            .lock()
            .devices
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state))
            .collect()
    }

    /// Devices waiting for a heartbeat retry
    pub fn heartbeat_devices(&self) -> Vec<String> {
        self.inner.registry.lock().heartbeat.iter().cloned().collect()
    }

    pub fn has_broker(&self, id: &str) -> bool {
        self.inner.registry.lock().brokers.contains_key(id)
    }

    /// Cycle results of every collecting device
    pub fn subscribe(&self) -> broadcast::Receiver<CycleResult> {
        self.inner.results.subscribe()
    }

    /// Retry readiness for every unconnected device; returns how many left
    /// `Unconnected`
    pub async fn heartbeat_once(&self) -> usize {
        // Snapshot so registrations can proceed during the sweep
        let pending = self.heartbeat_devices();
        let mut recovered = 0;

        for id in pending {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if self.device_state(&id) != Some(DeviceState::Unconnected) {
                self.inner.registry.lock().heartbeat.remove(&id);
                continue;
            }
            match self.ready(&id).await {
                Ok(DeviceState::Unconnected) => debug!("Dev{}: still unreachable", id),
                Ok(state) => {
                    info!("Dev{}: recovered by heartbeat ({})", id, state);
                    recovered += 1;
                },
                Err(e) => warn!("Dev{}: heartbeat retry failed: {}", id, e),
            }
        }
        recovered
    }

    /// Stop background tasks and destroy every broker
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Manager task failed: {}", e);
            }
        }

        let _lifecycle = self.inner.lifecycle.lock().await;
        let ids: Vec<String> = self.inner.registry.lock().brokers.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
        info!("Device manager stopped");
    }

    // ------------------------------------------------------------------------
    // Lifecycle internals; callers hold the lifecycle lock
    // ------------------------------------------------------------------------

    /// Attempt to bring a device into collection
    ///
    /// Connect failures and empty configurations are outcomes, returned as
    /// the new state. Other failures leave the state untouched.
    async fn ready(&self, id: &str) -> CollectResult<DeviceState> {
        let (device, generation) = {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .devices
                .get_mut(id)
                .ok_or_else(|| CollectError::DeviceNotFound(id.to_string()))?;
            entry.generation += 1;
            (Arc::clone(&entry.device), entry.generation)
        };

        let factory = self.inner.transports.factory_for(&device.read());
        let outcome = match factory {
            Ok(factory) => Broker::connect(device, factory, self.inner.settings).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok((broker, results)) => {
                broker.collect();
                {
                    let mut registry = self.inner.registry.lock();
                    if let Some(entry) = registry.devices.get_mut(id) {
                        entry.state = DeviceState::Collecting;
                    }
                    registry.brokers.insert(id.to_string(), Arc::new(broker));
                    registry.heartbeat.remove(id);
                }
                tokio::spawn(
                    self.clone()
                        .consume_results(id.to_string(), generation, results),
                );
                info!("Dev{}: collecting", id);
                Ok(DeviceState::Collecting)
            },
            Err(CollectError::EmptyVariableSet) => {
                self.settle(id, DeviceState::EmptyVariable, false);
                info!("Dev{}: no variables, nothing to collect", id);
                Ok(DeviceState::EmptyVariable)
            },
            Err(e @ CollectError::ConnectFailure(_)) => {
                self.settle(id, DeviceState::Unconnected, true);
                warn!("Dev{}: {}, queued for heartbeat", id, e);
                Ok(DeviceState::Unconnected)
            },
            Err(e) => {
                error!("Dev{}: cannot collect: {}", id, e);
                Err(e)
            },
        }
    }

    fn settle(&self, id: &str, state: DeviceState, retry: bool) {
        let mut registry = self.inner.registry.lock();
        if let Some(entry) = registry.devices.get_mut(id) {
            entry.state = state;
        }
        if retry {
            registry.heartbeat.insert(id.to_string());
        } else {
            registry.heartbeat.remove(id);
        }
    }

    /// Destroy the broker (if any) and mark the device stopped
    async fn teardown(&self, id: &str) {
        let broker = {
            let mut registry = self.inner.registry.lock();
            if let Some(entry) = registry.devices.get_mut(id) {
                entry.state = DeviceState::Stopped;
                entry.generation += 1;
            }
            registry.heartbeat.remove(id);
            registry.brokers.remove(id)
        };
        if let Some(broker) = broker {
            broker.destroy().await;
        }
    }

    async fn consume_results(
        self,
        id: String,
        generation: u64,
        mut results: mpsc::Receiver<CycleResult>,
    ) {
        while let Some(result) = results.recv().await {
            let next = if result.is_clean() {
                DeviceState::Collecting
            } else {
                DeviceState::CollectingError
            };
            let current = {
                let mut registry = self.inner.registry.lock();
                match registry.devices.get_mut(&id) {
                    Some(entry) if entry.generation == generation => {
                        entry.state = next;
                        true
                    },
                    _ => false,
                }
            };
            if !current {
                break;
            }
            // No subscribers is fine
            let _ = self.inner.results.send(result);
        }
        debug!("Dev{}: result stream closed", id);
    }

    async fn run_control_queue(self, mut control_rx: mpsc::Receiver<ControlRequest>) {
        loop {
            let request = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                request = control_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Err(e) = self.apply_control(&request.device_id, request.event).await {
                warn!(
                    "Dev{}: control {} failed: {}",
                    request.device_id, request.event, e
                );
            }
        }
        debug!("Control queue stopped");
    }

    async fn run_heartbeat(self) {
        let period = self.inner.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let recovered = self.heartbeat_once().await;
                    if recovered > 0 {
                        info!("Heartbeat recovered {} devices", recovered);
                    }
                },
            }
        }
        debug!("Heartbeat stopped");
    }
}

/// Flatten a JSON action body into `(name, value)` pairs
///
/// Accepts one object (`{"a": 1}`) or a list of objects
/// (`[{"a": 1}, {"b": true}]`); names repeated across objects are kept so
/// they can be reported as duplicates.
pub fn parse_actions(body: &serde_json::Value) -> CollectResult<Vec<(String, serde_json::Value)>> {
    fn push_object(
        object: &serde_json::Map<String, serde_json::Value>,
        out: &mut Vec<(String, serde_json::Value)>,
    ) {
        out.extend(object.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let mut actions = Vec::new();
    match body {
        serde_json::Value::Object(object) => push_object(object, &mut actions),
        serde_json::Value::Array(items) => {
            for item in items {
                let object = item.as_object().ok_or_else(|| {
                    CollectError::invalid_value("action", "list items must be objects")
                })?;
                push_object(object, &mut actions);
            }
        },
        _ => {
            return Err(CollectError::invalid_value(
                "action",
                "expected an object or a list of objects",
            ))
        },
    }
    Ok(actions)
}
