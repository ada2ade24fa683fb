// MIT License - Copyright (c) 2021 TJForc

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DEVICE_PORT, DEFAULT_EVENT_DEBOUNCE,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_PENDING_TIMEOUT,
    DEFAULT_PERIODIC_DEBOUNCE, DEFAULT_RECONNECT_DELAY, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_WRITER_TICK,
};

/// Device protocol version.
///
/// `V1` devices only encrypt control payloads (base64 ciphertext behind an
/// MD5 auth fragment); `V2` devices encrypt every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1")]
    V1,
    #[default]
    #[serde(rename = "3.3")]
    V2,
}

impl ProtocolVersion {
    /// The version tag as it appears on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::V1 => "3.1",
            Self::V2 => "3.3",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "3.1" => Some(Self::V1),
            "3.3" => Some(Self::V2),
            _ => None,
        }
    }
}

/// Configuration for one device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device identifier (`devId`)
    pub device_id: String,
    /// Gateway identifier (`gwId`), same as the device id for directly connected devices
    pub gateway_id: String,
    /// Device IP address
    pub ip_address: String,
    /// Device TCP port (default: 6668)
    pub port: u16,
    /// Shared secret, 16 ASCII bytes
    pub local_key: String,
    pub protocol_version: ProtocolVersion,
    /// How long a correlated request waits for its reply
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Heartbeat probe interval
    pub heartbeat_interval: Duration,
    /// Silence after which the session is declared lost
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            gateway_id: String::new(),
            ip_address: "192.168.0.100".to_string(),
            port: DEFAULT_DEVICE_PORT,
            local_key: String::new(),
            protocol_version: ProtocolVersion::V2,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// `ip:port` of the device.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Sets the device id; the gateway id follows it unless set explicitly.
    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if self.config.gateway_id.is_empty() || self.config.gateway_id == self.config.device_id {
            self.config.gateway_id = id.clone();
        }
        self.config.device_id = id;
        self
    }

    pub fn gateway_id(mut self, id: impl Into<String>) -> Self {
        self.config.gateway_id = id.into();
        self
    }

    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.config.ip_address = ip.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn local_key(mut self, key: impl Into<String>) -> Self {
        self.config.local_key = key.into();
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// How the property writer discovers work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriterMode {
    /// Sweep every device on each tick, re-reading property state
    #[default]
    Periodic,
    /// Only write properties named by change notifications
    Event,
}

/// Configuration for the property writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub mode: WriterMode,
    /// Scheduler tick interval
    pub tick_interval: Duration,
    /// Minimum time between two write attempts for one property
    pub debounce: Duration,
    /// A pending flag older than this is reset
    pub pending_timeout: Duration,
}

impl WriterConfig {
    pub fn periodic() -> Self {
        Self {
            mode: WriterMode::Periodic,
            tick_interval: DEFAULT_WRITER_TICK,
            debounce: DEFAULT_PERIODIC_DEBOUNCE,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }

    pub fn event() -> Self {
        Self {
            mode: WriterMode::Event,
            tick_interval: DEFAULT_WRITER_TICK,
            debounce: DEFAULT_EVENT_DEBOUNCE,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }

    pub fn for_mode(mode: WriterMode) -> Self {
        match mode {
            WriterMode::Periodic => Self::periodic(),
            WriterMode::Event => Self::event(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::periodic()
    }
}

/// Configuration for the connector orchestrating all device sessions.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Base delay for exponential reconnection backoff
    pub reconnect_delay: Duration,
    /// Maximum doubling steps applied to the base delay
    pub max_backoff_exponent: u32,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_backoff_exponent: 4,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

impl ConnectorConfig {
    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(self.max_backoff_exponent);
        self.reconnect_delay.saturating_mul(1u32 << exponent)
    }
}
