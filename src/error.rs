// MIT License - Copyright (c) 2021 TJForc

use std::fmt;

use crate::protocol::LocalCommand;

/// Non-zero return code carried by a device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(pub u32);

impl ReturnCode {
    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// All errors that can occur in the local-device-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Request timeout: {command:?} (seq {sequence})")]
    RequestTimeout { command: LocalCommand, sequence: u32 },

    #[error("Connection closing")]
    ConnectionClosing,

    #[error("Session not connected")]
    NotConnected,

    #[error("Encoding error: {details}")]
    Encoding { details: String },

    #[error("Invalid payload: {details}")]
    InvalidPayload { details: String },

    #[error("Payload for {command:?} violates schema: {details}")]
    SchemaViolation { command: LocalCommand, details: String },

    #[error("Bad local key: {details}")]
    BadKey { details: String },

    #[error("Device rejected request with return code {0}")]
    DeviceRejected(ReturnCode),

    #[error("Device {device} has no address or local key configured")]
    NotConfigured { device: String },

    #[error("Unknown device: {device}")]
    UnknownDevice { device: String },

    #[error("Discovery failed: {reason}")]
    DiscoveryFailed { reason: String },

    #[error("Channel closed")]
    ChannelClosed,
}

impl BridgeError {
    /// Whether this error is transient and the connection should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_)
                | BridgeError::ConnectionTimeout
                | BridgeError::RequestTimeout { .. }
                | BridgeError::ConnectionClosing
                | BridgeError::NotConnected
                | BridgeError::ChannelClosed
        )
    }

    /// Whether this error is a fault in the payload of an otherwise valid frame.
    pub fn is_payload_fault(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidPayload { .. } | BridgeError::SchemaViolation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
