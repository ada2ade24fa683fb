// MIT License - Copyright (c) 2021 TJForc

//! Read model of devices, channels and properties, the state store holding
//! actual/expected values, and the outbound message queue.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{ConnectorConfig, ProtocolVersion, SessionConfig};
use crate::constants::DEFAULT_DEVICE_PORT;
use crate::error::{BridgeError, Result};
use crate::protocol::DataPointValue;

/// A configured device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    /// `devId` on the wire
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub local_key: Option<String>,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Defaults to the identifier
    #[serde(default)]
    pub gateway_id: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            name: None,
            ip_address: None,
            port: DEFAULT_DEVICE_PORT,
            local_key: None,
            protocol_version: ProtocolVersion::default(),
            gateway_id: None,
        }
    }

    /// Whether the device has everything needed to open a session.
    pub fn is_configured(&self) -> bool {
        self.ip_address.as_deref().is_some_and(|ip| !ip.is_empty())
            && self.local_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Session config for this device, or `NotConfigured` when the address or key is missing.
    pub fn session_config(&self, connector: &ConnectorConfig) -> Result<SessionConfig> {
        let (Some(ip), Some(key)) = (self.ip_address.as_deref(), self.local_key.as_deref()) else {
            return Err(BridgeError::NotConfigured {
                device: self.id.clone(),
            });
        };
        if ip.is_empty() || key.is_empty() {
            return Err(BridgeError::NotConfigured {
                device: self.id.clone(),
            });
        }

        Ok(SessionConfig::builder()
            .device_id(self.identifier.clone())
            .gateway_id(self.gateway_id.clone().unwrap_or_else(|| self.identifier.clone()))
            .ip_address(ip)
            .port(self.port)
            .local_key(key)
            .protocol_version(self.protocol_version)
            .request_timeout(connector.request_timeout)
            .heartbeat_interval(connector.heartbeat_interval)
            .heartbeat_timeout(connector.heartbeat_timeout)
            .build())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub device: String,
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A device property backed by one data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: String,
    pub device: String,
    pub channel: String,
    /// Data point key (`"1"`, `"20"`, ...)
    pub identifier: String,
    #[serde(default)]
    pub settable: bool,
    #[serde(default = "default_true")]
    pub queryable: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Stored state of one property.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertyState {
    /// Last value reported by the device
    pub actual: Option<DataPointValue>,
    /// Value requested locally and not yet confirmed
    pub expected: Option<DataPointValue>,
    /// Set when a write has been dispatched and not yet confirmed
    pub pending: Option<DateTime<Utc>>,
    pub valid: bool,
}

impl PropertyState {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Outcome of a state read.
#[derive(Debug, Clone, PartialEq)]
pub enum StateRead {
    Ready(PropertyState),
    /// The store is still fetching this state; try again later
    Fetching,
}

/// Partial update of a property state. Fields left untouched keep their value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    actual: Option<Option<DataPointValue>>,
    expected: Option<Option<DataPointValue>>,
    pending: Option<Option<DateTime<Utc>>>,
    valid: Option<bool>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actual(mut self, value: DataPointValue) -> Self {
        self.actual = Some(Some(value));
        self
    }

    pub fn expected(mut self, value: Option<DataPointValue>) -> Self {
        self.expected = Some(value);
        self
    }

    pub fn pending_since(mut self, at: DateTime<Utc>) -> Self {
        self.pending = Some(Some(at));
        self
    }

    pub fn clear_pending(mut self) -> Self {
        self.pending = Some(None);
        self
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = Some(valid);
        self
    }

    pub fn apply(self, state: &mut PropertyState) {
        if let Some(actual) = self.actual {
            state.actual = actual;
        }
        if let Some(expected) = self.expected {
            state.expected = expected;
        }
        if let Some(pending) = self.pending {
            state.pending = pending;
        }
        if let Some(valid) = self.valid {
            state.valid = valid;
        }
    }
}

/// Connection state reported downstream for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceConnectionState {
    Connected,
    Disconnected,
    Lost,
    /// Misconfigured or failing device that needs attention
    Alert,
    Unknown,
}

/// Notification for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorMessage {
    PropertyState {
        device: String,
        channel: String,
        property: String,
        actual: Option<DataPointValue>,
        expected: Option<DataPointValue>,
        pending: bool,
    },
    ConnectionState {
        device: String,
        state: DeviceConnectionState,
    },
    WriteFailed {
        device: String,
        property: String,
        reason: String,
    },
}

impl ConnectorMessage {
    pub fn property_state(property: &PropertyRecord, state: &PropertyState) -> Self {
        ConnectorMessage::PropertyState {
            device: property.device.clone(),
            channel: property.channel.clone(),
            property: property.id.clone(),
            actual: state.actual.clone(),
            expected: state.expected.clone(),
            pending: state.is_pending(),
        }
    }

    pub fn connection_state(device: &str, state: DeviceConnectionState) -> Self {
        ConnectorMessage::ConnectionState {
            device: device.to_string(),
            state,
        }
    }
}

/// Read-only configuration store.
pub trait Directory: Send + Sync {
    fn devices(&self) -> Vec<DeviceRecord>;
    fn find_device(&self, id: &str) -> Option<DeviceRecord>;
    fn find_channel(&self, id: &str) -> Option<ChannelRecord>;
    fn find_channels_for_device(&self, device: &str) -> Vec<ChannelRecord>;
    fn find_properties_for_device(&self, device: &str) -> Vec<PropertyRecord>;
    fn find_property(&self, id: &str) -> Option<PropertyRecord>;
}

/// Actual/expected value store.
pub trait StateStore: Send + Sync {
    fn read(&self, property: &PropertyRecord) -> StateRead;
    /// Apply `update` and return the resulting state.
    fn set(&self, property: &PropertyRecord, update: StateUpdate) -> PropertyState;
}

/// Fire-and-forget outbound queue.
pub trait MessageQueue: Send + Sync {
    fn append(&self, message: ConnectorMessage);
}

/// Directory kept in memory, filled from configuration.
#[derive(Default)]
pub struct InMemoryDirectory {
    devices: RwLock<BTreeMap<String, DeviceRecord>>,
    channels: RwLock<BTreeMap<String, ChannelRecord>>,
    properties: RwLock<BTreeMap<String, PropertyRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_device(&self, device: DeviceRecord) {
        self.devices.write().insert(device.id.clone(), device);
    }

    pub fn insert_channel(&self, channel: ChannelRecord) {
        self.channels.write().insert(channel.id.clone(), channel);
    }

    pub fn insert_property(&self, property: PropertyRecord) {
        self.properties.write().insert(property.id.clone(), property);
    }

    /// Remove a device with its channels and properties.
    pub fn remove_device(&self, id: &str) {
        self.devices.write().remove(id);
        self.channels.write().retain(|_, c| c.device != id);
        self.properties.write().retain(|_, p| p.device != id);
    }

    pub fn remove_channel(&self, id: &str) {
        self.channels.write().remove(id);
    }

    pub fn remove_property(&self, id: &str) {
        self.properties.write().remove(id);
    }

    /// Find a property by device and data point key.
    pub fn find_property_by_identifier(&self, device: &str, identifier: &str) -> Option<PropertyRecord> {
        self.properties
            .read()
            .values()
            .find(|p| p.device == device && p.identifier == identifier)
            .cloned()
    }
}

impl Directory for InMemoryDirectory {
    fn devices(&self) -> Vec<DeviceRecord> {
        self.devices.read().values().cloned().collect()
    }

    fn find_device(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(id).cloned()
    }

    fn find_channel(&self, id: &str) -> Option<ChannelRecord> {
        self.channels.read().get(id).cloned()
    }

    fn find_channels_for_device(&self, device: &str) -> Vec<ChannelRecord> {
        self.channels
            .read()
            .values()
            .filter(|c| c.device == device)
            .cloned()
            .collect()
    }

    fn find_properties_for_device(&self, device: &str) -> Vec<PropertyRecord> {
        self.properties
            .read()
            .values()
            .filter(|p| p.device == device)
            .cloned()
            .collect()
    }

    fn find_property(&self, id: &str) -> Option<PropertyRecord> {
        self.properties.read().get(id).cloned()
    }
}

/// State store kept in memory.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, PropertyState>>,
    fetching: Mutex<HashSet<String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a property's state (default if never set).
    pub fn get(&self, property: &str) -> PropertyState {
        self.states.lock().get(property).cloned().unwrap_or_default()
    }

    /// Make `read()` report `Fetching` for a property until cleared.
    pub fn set_fetching(&self, property: &str, fetching: bool) {
        let mut set = self.fetching.lock();
        if fetching {
            set.insert(property.to_string());
        } else {
            set.remove(property);
        }
    }
}

impl StateStore for InMemoryStateStore {
    fn read(&self, property: &PropertyRecord) -> StateRead {
        if self.fetching.lock().contains(&property.id) {
            return StateRead::Fetching;
        }
        StateRead::Ready(self.get(&property.id))
    }

    fn set(&self, property: &PropertyRecord, update: StateUpdate) -> PropertyState {
        let mut states = self.states.lock();
        let state = states.entry(property.id.clone()).or_default();
        update.apply(state);
        state.clone()
    }
}

/// Message queue backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<ConnectorMessage>,
}

impl ChannelQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageQueue for ChannelQueue {
    fn append(&self, message: ConnectorMessage) {
        if self.tx.send(message).is_err() {
            debug!("Message queue closed, dropping message");
        }
    }
}
