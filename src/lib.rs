// MIT License - Copyright (c) 2021 TJForc
//
//! # local-device-bridge
//!
//! Local LAN control of smart devices speaking the framed, AES-encrypted
//! device protocol (versions 3.1 and 3.3), without a vendor cloud.
//!
//! The crate provides:
//! - a frame codec with CRC validation and per-version payload encryption,
//! - per-session request/reply correlation with timeouts,
//! - a device session with heartbeat supervision,
//! - a debounced property writer driven by a device/property directory,
//! - a connector that supervises one session per device and reconnects.
//!
//! ## Quick Start
//!
//! ```no_run
//! use local_device_bridge::{DeviceSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::builder()
//!         .device_id("bf0123456789abcdef")
//!         .ip_address("192.168.0.50")
//!         .local_key("0123456789abcdef")
//!         .build();
//!
//!     let session = DeviceSession::new(config)?;
//!     let mut events = session.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     session.connect().await?;
//!     for dp in session.read_states().await? {
//!         println!("{} = {}", dp.id, dp.value);
//!     }
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connector;
pub mod constants;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod event;
pub mod protocol;
pub mod transport;
pub mod writer;

// Re-exports for convenience
pub use codec::{FrameBuffer, FrameCodec};
pub use config::{ConnectorConfig, ProtocolVersion, SessionConfig, WriterConfig, WriterMode};
pub use connector::Connector;
pub use directory::{
    ChannelQueue, ChannelRecord, ConnectorMessage, DeviceConnectionState, DeviceRecord, Directory,
    InMemoryDirectory, InMemoryStateStore, MessageQueue, PropertyRecord, PropertyState, StateStore,
    StateUpdate,
};
pub use error::{BridgeError, Result, ReturnCode};
pub use event::{EventReceiver, SessionEvent};
pub use protocol::{DataPoint, DataPointValue, DecodedMessage, LocalCommand, MessagePayload};
pub use transport::{DeviceSession, DiscoveredDevice, SessionState, SessionStatus, discover};
pub use writer::{PropertyTransport, PropertyWriter, WriteTarget};
