//! Per-device polling broker
//!
//! A broker exists while its device is collecting. It owns the packed read
//! frames and the connection pool, runs the poll loop, and serves write
//! actions on the same pool.
//!
//! One poll cycle spawns a task per frame. Each task sends its outcome over
//! an mpsc channel to an aggregator task; once every frame task has
//! finished the aggregate is emitted as a single [`CycleResult`].

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use errors::{CollectError, CollectResult, ErrorInfo};
use fieldlink_modbus::{
    encode_write, pack_frames, ConnectionPool, Device, Messenger, MessengerFactory, RequestFrame,
    Transport, Value, VariableValue,
};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;

/// Device shared between the manager and its broker
pub type SharedDevice = Arc<RwLock<Device>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Attempts per frame read
    pub max_attempts: u32,
    /// Capacity of the result channel
    pub result_buffer: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            result_buffer: 16,
        }
    }
}

impl From<&CollectorConfig> for BrokerSettings {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            result_buffer: config.result_buffer,
        }
    }
}

/// Aggregate of one poll cycle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub device_id: String,
    pub variables: Vec<VariableValue>,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<CollectError>,
    pub timestamp: DateTime<Utc>,
}

impl CycleResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

fn serialize_errors<S: Serializer>(errors: &[CollectError], s: S) -> Result<S::Ok, S::Error> {
    let infos: Vec<ErrorInfo> = errors.iter().map(CollectError::to_error_info).collect();
    infos.serialize(s)
}

type FrameOutcome = CollectResult<Vec<(usize, VariableValue)>>;

struct BrokerCore {
    device_id: String,
    transport: Transport,
    slave: u8,
    interval: Duration,
    device: SharedDevice,
    frames: Vec<Arc<RequestFrame>>,
    pool: ConnectionPool,
    max_attempts: u32,
    write_txn: AtomicU16,
}

pub struct Broker {
    core: Arc<BrokerCore>,
    cancel: CancellationToken,
    results: Mutex<Option<mpsc::Sender<CycleResult>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("device_id", &self.core.device_id)
            .field("frames", &self.core.frames.len())
            .field("pool", &self.core.pool.max_size())
            .finish()
    }
}

impl Broker {
    /// Pack frames and open the pool
    ///
    /// A device without variables yields `EmptyVariableSet`; a pool that
    /// cannot open its connections yields `ConnectFailure`.
    pub async fn connect(
        device: SharedDevice,
        factory: Arc<dyn MessengerFactory>,
        settings: BrokerSettings,
    ) -> CollectResult<(Self, mpsc::Receiver<CycleResult>)> {
        let snapshot = device.read().clone();
        let frames: Vec<Arc<RequestFrame>> =
            pack_frames(&snapshot)?.into_iter().map(Arc::new).collect();

        let pool_size = snapshot.device_model.pool_size(frames.len());
        let pool = ConnectionPool::new(factory, pool_size);
        pool.prefill().await?;

        info!(
            "Dev{}: {} frames, {} connections ({})",
            snapshot.id,
            frames.len(),
            pool_size,
            snapshot.device_model
        );

        let (tx, rx) = mpsc::channel(settings.result_buffer.max(1));
        let core = BrokerCore {
            device_id: snapshot.id.clone(),
            transport: snapshot.device_model,
            slave: snapshot.slave,
            interval: snapshot.poll_interval(),
            device,
            frames,
            pool,
            max_attempts: settings.max_attempts.max(1),
            write_txn: AtomicU16::new(0),
        };

        Ok((
            Self {
                core: Arc::new(core),
                cancel: CancellationToken::new(),
                results: Mutex::new(Some(tx)),
                task: Mutex::new(None),
            },
            rx,
        ))
    }

    pub fn device_id(&self) -> &str {
        &self.core.device_id
    }

    pub fn frame_count(&self) -> usize {
        self.core.frames.len()
    }

    pub fn is_collecting(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the poll loop; a second call is a no-op
    pub fn collect(&self) {
        let Some(results) = self.results.lock().take() else {
            return;
        };
        let core = Arc::clone(&self.core);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let started = Instant::now();
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = core.poll_cycle() => result,
                };
                if results.send(result).await.is_err() {
                    debug!("Dev{}: result receiver dropped", core.device_id);
                    break;
                }

                let wait = core.interval.saturating_sub(started.elapsed());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {},
                }
            }
            debug!("Dev{}: poll loop stopped", core.device_id);
        });
        *self.task.lock() = Some(task);
    }

    /// Run one poll cycle outside the loop
    pub async fn poll_once(&self) -> CycleResult {
        self.core.poll_cycle().await
    }

    /// Write each `(variable, value)` pair
    ///
    /// Every write is attempted; failures are collected and returned
    /// together once all writes have been tried.
    pub async fn deliver_action(
        &self,
        actions: &[(String, serde_json::Value)],
    ) -> CollectResult<()> {
        let mut failures = Vec::new();
        for (name, value) in actions {
            if let Err(e) = self.core.write_variable(name, value).await {
                warn!("Dev{}: write {} failed: {}", self.core.device_id, name, e);
                failures.push(e);
            }
        }
        CollectError::from_many(failures)
    }

    /// Stop the loop, close the pool and the result stream
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Dev{}: poll task failed: {}", self.core.device_id, e);
            }
        }
        self.results.lock().take();
        self.core.pool.destroy().await;
        info!("Dev{}: broker destroyed", self.core.device_id);
    }
}

impl BrokerCore {
    async fn poll_cycle(self: &Arc<Self>) -> CycleResult {
        let (tx, mut rx) = mpsc::channel::<FrameOutcome>(self.frames.len().max(1));

        let aggregator = tokio::spawn(async move {
            let mut values = Vec::new();
            let mut errors = Vec::new();
            while let Some(outcome) = rx.recv().await {
                match outcome {
                    Ok(decoded) => values.extend(decoded),
                    Err(e) => errors.push(e),
                }
            }
            (values, errors)
        });

        let tasks: Vec<_> = self
            .frames
            .iter()
            .map(|frame| {
                let core = Arc::clone(self);
                let frame = Arc::clone(frame);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let outcome = core.read_frame(&frame).await;
                    let _ = tx.send(outcome).await;
                })
            })
            .collect();
        drop(tx);

        // A panicking frame task is contained here
        let mut faults = Vec::new();
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!("Dev{}: frame task failed: {}", self.device_id, e);
                faults.push(CollectError::internal(format!("frame task failed: {e}")));
            }
        }

        let (mut values, mut errors) = match aggregator.await {
            Ok(merged) => merged,
            Err(e) => (
                Vec::new(),
                vec![CollectError::internal(format!("aggregator failed: {e}"))],
            ),
        };
        errors.extend(faults);

        values.sort_by_key(|(index, _)| *index);
        let latest: Vec<(usize, Value)> = values.iter().map(|(i, v)| (*i, v.value)).collect();
        self.device.write().apply_values(&latest);

        if errors.is_empty() {
            debug!("Dev{}: {} values", self.device_id, values.len());
        } else {
            warn!(
                "Dev{}: {} values, {} errors",
                self.device_id,
                values.len(),
                errors.len()
            );
        }

        CycleResult {
            device_id: self.device_id.clone(),
            variables: values.into_iter().map(|(_, v)| v).collect(),
            errors,
            timestamp: Utc::now(),
        }
    }

    async fn read_frame(&self, frame: &RequestFrame) -> FrameOutcome {
        let label = format!("FC{:02X}@{}", frame.function_code, frame.start_address);
        let payload = self
            .exchange(
                &label,
                self.max_attempts,
                frame.expected_len,
                || frame.next_request(),
                |response, txn| frame.validate(response, txn).map(<[u8]>::to_vec),
            )
            .await?;
        frame.decode(&payload)
    }

    async fn write_variable(&self, name: &str, value: &serde_json::Value) -> CollectResult<()> {
        let request = {
            let device = self.device.read();
            let variable = device
                .variable(name)
                .ok_or_else(|| CollectError::VariableNotFound(name.to_string()))?;
            encode_write(&device, variable, value)?
        };

        let function_code = request.function_code;
        self.exchange(
            &format!("write {name}"),
            1,
            self.transport.expected_write_len(),
            || {
                let txn = self
                    .write_txn
                    .fetch_add(1, Ordering::Relaxed)
                    .wrapping_add(1);
                (txn, self.transport.encode(txn, self.slave, &request.pdu))
            },
            |response, txn| {
                self.transport
                    .validate_write_response(response, txn, self.slave, function_code)
            },
        )
        .await?;

        debug!("Dev{}: wrote {} = {}", self.device_id, name, value);
        Ok(())
    }

    /// Send a request and validate its response, up to `attempts` times
    ///
    /// Bad connections replace the messenger; validation failures resend on
    /// the same one.
    async fn exchange<T>(
        &self,
        label: &str,
        attempts: u32,
        expected_len: usize,
        mut build: impl FnMut() -> (u16, Vec<u8>),
        check: impl Fn(&[u8], u16) -> CollectResult<T>,
    ) -> CollectResult<T> {
        let mut held: Option<Box<dyn Messenger>> = None;

        for attempt in 1..=attempts {
            let mut messenger = match held.take() {
                Some(m) => m,
                None => match self.pool.acquire().await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Dev{}: {} attempt {}: {}", self.device_id, label, attempt, e);
                        continue;
                    },
                },
            };

            let (txn, request) = build();
            let response = match messenger.ask(&request, expected_len).await {
                Ok(response) => response,
                Err(e) if e.is_bad_connection() => {
                    warn!(
                        "Dev{}: {} attempt {}: {}, reconnecting",
                        self.device_id, label, attempt, e
                    );
                    match self.pool.replace(messenger).await {
                        Ok(fresh) => held = Some(fresh),
                        Err(e) => warn!("Dev{}: reconnect failed: {}", self.device_id, e),
                    }
                    continue;
                },
                Err(e) => {
                    self.pool.release(messenger).await;
                    return Err(e);
                },
            };

            match check(&response, txn) {
                Ok(value) => {
                    self.pool.release(messenger).await;
                    return Ok(value);
                },
                Err(e) if e.is_validation() => {
                    warn!("Dev{}: {} attempt {}: {}", self.device_id, label, attempt, e);
                    held = Some(messenger);
                },
                Err(e) => {
                    self.pool.release(messenger).await;
                    return Err(e);
                },
            }
        }

        if let Some(messenger) = held {
            self.pool.release(messenger).await;
        }
        error!(
            "Dev{}: {} failed after {} attempts",
            self.device_id, label, attempts
        );
        Err(CollectError::RetriesExhausted(attempts))
    }
}
