// MIT License - Copyright (c) 2021 TJForc

use std::time::Duration;

/// Frame magic bytes.
pub const PREFIX: [u8; 4] = [0x00, 0x00, 0x55, 0xAA];
pub const SUFFIX: [u8; 4] = [0x00, 0x00, 0xAA, 0x55];

/// Prefix + sequence + command + length.
pub const HEADER_SIZE: usize = 16;
/// CRC32 + suffix.
pub const TRAILER_SIZE: usize = 8;
/// Smallest frame: header and trailer with an empty payload.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + TRAILER_SIZE;
/// Frames announcing a larger body are treated as garbage.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Size of the optional return code that follows the header in device replies.
pub const RETURN_CODE_SIZE: usize = 4;

/// Length of the V1 auth fragment (an MD5 hex slice).
pub const V1_AUTH_FRAGMENT_LEN: usize = 16;
/// V2 header: the 3-byte version tag followed by 12 zero bytes.
pub const V2_HEADER_LEN: usize = 15;

/// Sequence number reserved for heartbeat probes (-100 on the wire).
pub const HEARTBEAT_SEQUENCE: u32 = (-100i32) as u32;

/// Device TCP control port.
pub const DEFAULT_DEVICE_PORT: u16 = 6668;
/// Plain-text UDP broadcast port.
pub const DISCOVERY_PORT_PLAIN: u16 = 6666;
/// Encrypted UDP broadcast port.
pub const DISCOVERY_PORT_ENCRYPTED: u16 = 6667;
/// The encrypted broadcast key is the MD5 digest of this seed.
pub const DISCOVERY_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(7);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_WRITER_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_PERIODIC_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_EVENT_DEBOUNCE: Duration = Duration::from_millis(2500);
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Capacity of the per-session event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
