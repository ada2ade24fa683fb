// MIT License - Copyright (c) 2021 TJForc

//! Supervises one session per configured device.
//!
//! Each device gets a supervisor task that connects, reconnects with
//! exponential backoff after a loss, and feeds status reports and read-backs
//! into the state store. The connector is also the writer's transport.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ConnectorConfig;
use crate::directory::{
    ConnectorMessage, DeviceConnectionState, DeviceRecord, Directory, MessageQueue, StateRead,
    StateStore, StateUpdate,
};
use crate::error::{BridgeError, Result};
use crate::event::SessionEvent;
use crate::protocol::{DataPoint, DataPointValue};
use crate::transport::DeviceSession;
use crate::writer::{PropertyTransport, WriteTarget};

struct ConnectorInner {
    config: ConnectorConfig,
    directory: Arc<dyn Directory>,
    states: Arc<dyn StateStore>,
    queue: Arc<dyn MessageQueue>,
    /// Keyed by device record id
    sessions: RwLock<HashMap<String, DeviceSession>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Device connection orchestrator.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        directory: Arc<dyn Directory>,
        states: Arc<dyn StateStore>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                config,
                directory,
                states,
                queue,
                sessions: RwLock::new(HashMap::new()),
                supervisors: Mutex::new(Vec::new()),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// Session of a device, if one was created.
    pub fn session(&self, device_id: &str) -> Option<DeviceSession> {
        self.inner.sessions.read().get(device_id).cloned()
    }

    /// Create sessions for every directory device and start supervising them.
    ///
    /// Devices without an address or key are reported as `alert` and get no
    /// session. Calling `start()` twice is a no-op.
    pub fn start(&self) {
        let shutdown_rx = {
            let mut guard = self.inner.shutdown.lock();
            if guard.is_some() {
                debug!("Connector already started");
                return;
            }
            let (tx, rx) = watch::channel(false);
            *guard = Some(tx);
            rx
        };

        for device in self.inner.directory.devices() {
            let config = match device.session_config(&self.inner.config) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Device {} cannot be connected: {}", device.id, e);
                    self.alert(&device.id);
                    continue;
                }
            };
            let session = match DeviceSession::new(config) {
                Ok(session) => session,
                Err(e) => {
                    error!("Device {} has an unusable local key: {}", device.id, e);
                    self.alert(&device.id);
                    continue;
                }
            };

            self.inner
                .sessions
                .write()
                .insert(device.id.clone(), session.clone());
            let handle = tokio::spawn(self.clone().supervise(device, session, shutdown_rx.clone()));
            self.inner.supervisors.lock().push(handle);
        }

        info!(
            "Connector started with {} device sessions",
            self.inner.sessions.read().len()
        );
    }

    /// Stop all supervisors and disconnect every session.
    pub async fn stop(&self) {
        let Some(tx) = self.inner.shutdown.lock().take() else {
            return;
        };
        let _ = tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.inner.supervisors.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Supervisor task ended abnormally: {e}");
            }
        }

        let sessions: Vec<DeviceSession> = self.inner.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.disconnect().await;
        }
        info!("Connector stopped");
    }

    /// Ask a device to re-report its queryable data points.
    ///
    /// Numeric data point keys go out as a refresh request; anything else
    /// falls back to a full read whose result is applied directly.
    pub async fn refresh(&self, device_id: &str) -> Result<()> {
        let session = self.connected_session(device_id)?;

        let mut dp_ids = Vec::new();
        let mut all_numeric = true;
        for property in self.inner.directory.find_properties_for_device(device_id) {
            if !property.queryable {
                continue;
            }
            match property.identifier.parse::<u32>() {
                Ok(id) => dp_ids.push(id),
                Err(_) => all_numeric = false,
            }
        }

        if all_numeric && !dp_ids.is_empty() {
            debug!("Refreshing {:?} on {}", dp_ids, device_id);
            session.refresh(dp_ids).await
        } else {
            let points = session.read_states().await?;
            self.apply_data_points(device_id, &points);
            Ok(())
        }
    }

    /// Store reported data points against the device's properties.
    ///
    /// A reported value equal to the expected one confirms the write and
    /// clears expected and pending. Returns the number of properties updated.
    pub fn apply_data_points(&self, device_id: &str, points: &[DataPoint]) -> usize {
        let properties = self.inner.directory.find_properties_for_device(device_id);
        let mut updated = 0;

        for point in points {
            let Some(property) = properties.iter().find(|p| p.identifier == point.id) else {
                debug!("{}: no property for data point {}", device_id, point.id);
                continue;
            };

            let mut update = StateUpdate::new().actual(point.value.clone()).valid(true);
            if let StateRead::Ready(state) = self.inner.states.read(property)
                && state.expected.as_ref() == Some(&point.value)
            {
                update = update.expected(None).clear_pending();
            }

            let state = self.inner.states.set(property, update);
            self.inner
                .queue
                .append(ConnectorMessage::property_state(property, &state));
            updated += 1;
        }
        updated
    }

    fn connected_session(&self, device_id: &str) -> Result<DeviceSession> {
        let device = self
            .inner
            .directory
            .find_device(device_id)
            .ok_or_else(|| BridgeError::UnknownDevice {
                device: device_id.to_string(),
            })?;
        if !device.is_configured() {
            return Err(BridgeError::NotConfigured { device: device.id });
        }
        match self.session(device_id) {
            Some(session) if session.is_connected() => Ok(session),
            _ => Err(BridgeError::NotConnected),
        }
    }

    fn alert(&self, device_id: &str) {
        self.publish_connection(device_id, DeviceConnectionState::Alert);
    }

    fn publish_connection(&self, device_id: &str, state: DeviceConnectionState) {
        self.inner
            .queue
            .append(ConnectorMessage::connection_state(device_id, state));
    }

    /// Connect, follow session events, and reconnect until shut down.
    async fn supervise(
        self,
        device: DeviceRecord,
        session: DeviceSession,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut events = session.subscribe();

        'outer: loop {
            // Reconnection loop, retries indefinitely with exponential backoff
            let mut attempt: u32 = 0;
            loop {
                if attempt > 0 {
                    let delay = self.inner.config.backoff(attempt);
                    error!(
                        "Connection attempt {attempt} to {} failed. Retrying in {:.1}s...",
                        device.id,
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break 'outer,
                        _ = sleep(delay) => {}
                    }
                }
                attempt += 1;

                tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    result = session.connect() => {
                        if result.is_ok() {
                            break;
                        }
                    }
                }
            }

            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    event = events.recv() => event,
                };

                match event {
                    Ok(SessionEvent::Connected { .. }) => {
                        self.publish_connection(&device.id, DeviceConnectionState::Connected);
                        let initial = tokio::select! {
                            _ = shutdown.changed() => break 'outer,
                            result = session.read_states() => result,
                        };
                        match initial {
                            Ok(points) => {
                                let n = self.apply_data_points(&device.id, &points);
                                debug!("{}: initial read updated {} properties", device.id, n);
                            }
                            Err(e) => warn!("{}: initial read failed: {}", device.id, e),
                        }
                    }
                    Ok(SessionEvent::Lost { .. }) => {
                        self.publish_connection(&device.id, DeviceConnectionState::Lost);
                        break;
                    }
                    Ok(SessionEvent::Disconnected { .. }) => {
                        self.publish_connection(&device.id, DeviceConnectionState::Disconnected);
                        break;
                    }
                    Ok(SessionEvent::StatusReport(message)) => {
                        self.apply_data_points(&device.id, message.data_points());
                    }
                    Ok(SessionEvent::Unsolicited(message)) => {
                        if !message.data_points().is_empty() {
                            self.apply_data_points(&device.id, message.data_points());
                        }
                    }
                    Ok(SessionEvent::Error { message, .. }) => {
                        warn!("{}: {}", device.id, message);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("{}: event receiver lagged, missed {n} events", device.id);
                    }
                    Err(RecvError::Closed) => {
                        info!("{}: event channel closed", device.id);
                        break 'outer;
                    }
                }
            }

            info!("Device {} will be reconnected", device.id);
        }

        session.disconnect().await;
        debug!("Supervisor for {} exiting", device.id);
    }
}

impl PropertyTransport for Connector {
    fn write_property(
        &self,
        target: &WriteTarget,
        value: DataPointValue,
    ) -> impl Future<Output = Result<()>> + Send {
        let session = self.connected_session(&target.device.id);
        let identifier = target.property.identifier.clone();
        async move {
            let session = session?;
            session
                .write_states(BTreeMap::from([(identifier, value)]))
                .await
        }
    }
}
