// MIT License - Copyright (c) 2021 TJForc

//! Frame encoding and decoding.
//!
//! ```text
//! offset  size  field
//! 0       4     prefix 00 00 55 AA
//! 4       4     sequence (BE)
//! 8       4     command (BE)
//! 12      4     length (BE), payload + CRC + suffix
//! 16      N     payload, optionally led by a 4-byte return code
//! 16+N    4     CRC32 over [0, 16+N)
//! 20+N    4     suffix 00 00 AA 55
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};

use crate::config::{ProtocolVersion, SessionConfig};
use crate::constants::{
    HEADER_SIZE, MAX_FRAME_SIZE, MIN_FRAME_SIZE, PREFIX, RETURN_CODE_SIZE, SUFFIX, TRAILER_SIZE,
    V1_AUTH_FRAGMENT_LEN, V2_HEADER_LEN,
};
use crate::crypto::{LocalCipher, crc32, md5_hex};
use crate::error::{BridgeError, Result, ReturnCode};
use crate::protocol::{DecodedMessage, LocalCommand, RequestPayload, interpret_payload};

/// Encodes and decodes frames for one device.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    device_id: String,
    version: ProtocolVersion,
    cipher: LocalCipher,
}

impl FrameCodec {
    pub fn new(device_id: impl Into<String>, version: ProtocolVersion, cipher: LocalCipher) -> Self {
        Self {
            device_id: device_id.into(),
            version,
            cipher,
        }
    }

    /// Build a codec from a session config. Fails if the local key is unusable.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let cipher = LocalCipher::from_local_key(&config.local_key)?;
        Ok(Self::new(
            config.device_id.clone(),
            config.protocol_version,
            cipher,
        ))
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Encode a request frame.
    pub fn encode(
        &self,
        sequence: u32,
        command: LocalCommand,
        payload: &RequestPayload,
    ) -> Result<Vec<u8>> {
        let json = payload.to_json()?;
        self.encode_json(sequence, command, None, json.as_bytes())
    }

    /// Encode a frame from JSON text, optionally carrying a return code.
    ///
    /// Requests never carry a return code; device replies do.
    pub fn encode_json(
        &self,
        sequence: u32,
        command: LocalCommand,
        return_code: Option<u32>,
        json: &[u8],
    ) -> Result<Vec<u8>> {
        let body = self.seal(command, json)?;
        Ok(build_frame(sequence, command.code(), return_code, &body))
    }

    /// Build the payload bytes for `command` according to the protocol version.
    fn seal(&self, command: LocalCommand, json: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            ProtocolVersion::V1 if command.is_control() => {
                let b64 = BASE64.encode(self.cipher.encrypt(json));
                let fragment = self.v1_auth_fragment(&b64);
                let mut body = Vec::with_capacity(3 + fragment.len() + b64.len());
                body.extend_from_slice(ProtocolVersion::V1.tag().as_bytes());
                body.extend_from_slice(fragment.as_bytes());
                body.extend_from_slice(b64.as_bytes());
                Ok(body)
            }
            ProtocolVersion::V1 => Ok(json.to_vec()),
            ProtocolVersion::V2 => {
                let encrypted = self.cipher.encrypt(json);
                if command.has_version_header() {
                    let mut body = version_header(ProtocolVersion::V2);
                    body.extend_from_slice(&encrypted);
                    Ok(body)
                } else {
                    Ok(encrypted)
                }
            }
        }
    }

    /// Characters 8..24 of `md5("data=<b64>||lpv=3.1||<key>")`.
    fn v1_auth_fragment(&self, b64: &str) -> String {
        let mut preimage = Vec::with_capacity(b64.len() + 32);
        preimage.extend_from_slice(b"data=");
        preimage.extend_from_slice(b64.as_bytes());
        preimage.extend_from_slice(b"||lpv=");
        preimage.extend_from_slice(ProtocolVersion::V1.tag().as_bytes());
        preimage.extend_from_slice(b"||");
        preimage.extend_from_slice(self.cipher.key());
        let digest = md5_hex(&preimage);
        digest[8..8 + V1_AUTH_FRAGMENT_LEN].to_string()
    }

    /// Decode one complete frame.
    ///
    /// Returns `Ok(None)` for frames to drop: bad magic, bad length, CRC
    /// mismatch or unknown command. Returns `Err` only when the frame is
    /// intact but its payload cannot be interpreted.
    pub fn decode(&self, frame: &[u8]) -> Result<Option<DecodedMessage>> {
        let Some(raw) = split_frame(frame) else {
            return Ok(None);
        };

        let Some(command) = LocalCommand::from_code(raw.command) else {
            warn!(
                "Dropping frame with unknown command {} from {}",
                raw.command, self.device_id
            );
            return Ok(None);
        };

        let plain = self.open(raw.body)?;
        let payload = interpret_payload(command, &plain)?;

        Ok(Some(DecodedMessage {
            device_id: self.device_id.clone(),
            command,
            sequence: raw.sequence,
            return_code: raw.return_code,
            payload,
        }))
    }

    /// Strip version headers and decrypt a payload into JSON text.
    fn open(&self, body: &[u8]) -> Result<Vec<u8>> {
        if body.is_empty() {
            return Ok(Vec::new());
        }

        let v1_tag = ProtocolVersion::V1.tag().as_bytes();
        if body.starts_with(v1_tag) {
            // 3.1 control: tag, auth fragment, base64 ciphertext
            let start = v1_tag.len() + V1_AUTH_FRAGMENT_LEN;
            if body.len() <= start {
                return Err(BridgeError::InvalidPayload {
                    details: "3.1 payload shorter than its auth fragment".to_string(),
                });
            }
            let ciphertext = BASE64.decode(&body[start..]).map_err(|e| BridgeError::InvalidPayload {
                details: format!("3.1 payload is not base64: {}", e),
            })?;
            return self.cipher.decrypt(&ciphertext);
        }

        let body = strip_v2_header(body);
        if body.is_empty() || looks_like_json(body) {
            return Ok(body.to_vec());
        }

        let plain = self.cipher.decrypt(body)?;
        // Some firmwares put the version header inside the ciphertext
        Ok(strip_v2_header(&plain).to_vec())
    }
}

/// Fields of a frame that passed the magic, length and CRC checks.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame<'a> {
    pub sequence: u32,
    pub command: u32,
    pub return_code: Option<ReturnCode>,
    pub body: &'a [u8],
}

/// Validate framing and split out header fields.
///
/// Every rejection is logged at debug level and returns `None`.
pub fn split_frame(frame: &[u8]) -> Option<RawFrame<'_>> {
    let len = frame.len();
    if len < MIN_FRAME_SIZE {
        debug!("Dropping short frame ({} bytes)", len);
        return None;
    }
    if frame[..4] != PREFIX || frame[len - 4..] != SUFFIX {
        debug!("Dropping frame with bad magic");
        return None;
    }

    let sequence = read_u32(frame, 4);
    let command = read_u32(frame, 8);
    let length = read_u32(frame, 12) as usize;
    if HEADER_SIZE + length != len {
        debug!(
            "Dropping frame: length field {} does not match frame size {}",
            length, len
        );
        return None;
    }

    let received_crc = read_u32(frame, len - TRAILER_SIZE);
    let computed_crc = crc32(&frame[..len - TRAILER_SIZE]);
    if received_crc != computed_crc {
        debug!(
            "Dropping frame: CRC mismatch (expected {:08X}, got {:08X})",
            computed_crc, received_crc
        );
        return None;
    }

    let mut body = &frame[HEADER_SIZE..len - TRAILER_SIZE];
    let mut return_code = None;
    if body.len() >= RETURN_CODE_SIZE {
        let candidate = read_u32(body, 0);
        let rest = &body[RETURN_CODE_SIZE..];
        if candidate & 0xFFFF_FF00 == 0 && is_payload_shaped(rest) {
            return_code = Some(ReturnCode(candidate));
            body = rest;
        }
    }

    Some(RawFrame {
        sequence,
        command,
        return_code,
        body,
    })
}

/// Assemble a frame around an already sealed payload.
pub fn build_frame(sequence: u32, command: u32, return_code: Option<u32>, body: &[u8]) -> Vec<u8> {
    let rc_len = if return_code.is_some() { RETURN_CODE_SIZE } else { 0 };
    let length = rc_len + body.len() + TRAILER_SIZE;

    let mut frame = Vec::with_capacity(HEADER_SIZE + length);
    frame.extend_from_slice(&PREFIX);
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame.extend_from_slice(&command.to_be_bytes());
    frame.extend_from_slice(&(length as u32).to_be_bytes());
    if let Some(rc) = return_code {
        frame.extend_from_slice(&rc.to_be_bytes());
    }
    frame.extend_from_slice(body);
    let crc = crc32(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&SUFFIX);
    frame
}

fn version_header(version: ProtocolVersion) -> Vec<u8> {
    let mut header = Vec::with_capacity(V2_HEADER_LEN);
    header.extend_from_slice(version.tag().as_bytes());
    header.resize(V2_HEADER_LEN, 0);
    header
}

fn strip_v2_header(body: &[u8]) -> &[u8] {
    if body.len() >= V2_HEADER_LEN && body.starts_with(ProtocolVersion::V2.tag().as_bytes()) {
        &body[V2_HEADER_LEN..]
    } else {
        body
    }
}

/// Whether `body` can stand alone as a payload: empty, plain JSON, a
/// version-tagged body or whole AES blocks.
///
/// Ciphertext that happens to start with zero bytes is not taken for a
/// return code, since dropping four bytes would break its block alignment.
fn is_payload_shaped(body: &[u8]) -> bool {
    body.is_empty() || body[0] == b'{' || body.starts_with(b"3.") || body.len() % 16 == 0
}

fn looks_like_json(body: &[u8]) -> bool {
    let end = body
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
        .map_or(0, |i| i + 1);
    body[0] == b'{' && serde_json::from_slice::<serde::de::IgnoredAny>(&body[..end]).is_ok()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Splits a byte stream into frames.
///
/// Bytes ahead of a prefix are discarded; a partial frame is kept until the
/// rest arrives; a frame with a bad length or suffix is skipped by
/// resynchronising on the next prefix.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match find_prefix(&self.buf) {
                Some(0) => {}
                Some(pos) => {
                    debug!("Discarding {} bytes ahead of frame prefix", pos);
                    self.buf.drain(..pos);
                }
                None => {
                    // Keep a tail that may be the start of a prefix
                    let keep = self.buf.len().min(PREFIX.len() - 1);
                    let drop = self.buf.len() - keep;
                    if drop > 0 {
                        debug!("Discarding {} bytes without frame prefix", drop);
                        self.buf.drain(..drop);
                    }
                    return None;
                }
            }

            if self.buf.len() < HEADER_SIZE {
                return None;
            }

            let length = read_u32(&self.buf, 12) as usize;
            let total = HEADER_SIZE + length;
            if length < TRAILER_SIZE || total > MAX_FRAME_SIZE {
                debug!("Resyncing after frame with implausible length {}", length);
                self.buf.drain(..1);
                continue;
            }
            if self.buf.len() < total {
                return None;
            }
            if self.buf[total - 4..total] != SUFFIX {
                debug!("Resyncing after frame without suffix");
                self.buf.drain(..1);
                continue;
            }
            return Some(self.buf.drain(..total).collect());
        }
    }
}

fn find_prefix(buf: &[u8]) -> Option<usize> {
    buf.windows(PREFIX.len()).position(|w| w == PREFIX)
}
