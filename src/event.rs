// MIT License - Copyright (c) 2021 TJForc

use crate::protocol::DecodedMessage;

/// Events emitted by a device session.
///
/// Subscribers obtain a `tokio::sync::broadcast::Receiver<SessionEvent>`
/// via `session.subscribe()`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// TCP connection to the device established
    Connected { device_id: String },
    /// Session closed by `disconnect()` or by the device
    Disconnected { device_id: String },
    /// No heartbeat reply within the timeout; the session has been torn down
    Lost { device_id: String },
    /// Connect failure or transport fault
    Error { device_id: String, message: String },
    /// Data point update pushed by the device
    StatusReport(DecodedMessage),
    /// Any other uncorrelated message
    Unsolicited(DecodedMessage),
}

impl SessionEvent {
    pub fn device_id(&self) -> &str {
        match self {
            SessionEvent::Connected { device_id }
            | SessionEvent::Disconnected { device_id }
            | SessionEvent::Lost { device_id }
            | SessionEvent::Error { device_id, .. } => device_id,
            SessionEvent::StatusReport(msg) | SessionEvent::Unsolicited(msg) => &msg.device_id,
        }
    }
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<SessionEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
