// MIT License - Copyright (c) 2021 TJForc

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::config::ProtocolVersion;
use crate::constants::{DISCOVERY_PORT_ENCRYPTED, DISCOVERY_PORT_PLAIN};
use crate::crypto::LocalCipher;
use crate::error::{BridgeError, Result};
use crate::protocol::MessagePayload;

/// A device seen broadcasting on the LAN.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub gateway_id: String,
    pub ip_address: String,
    pub protocol_version: Option<ProtocolVersion>,
    pub product_key: Option<String>,
    /// Whether the device uses encrypted local traffic
    pub encrypted: bool,
    pub source: SocketAddr,
}

/// Codec for broadcast frames: plain JSON on 6666, encrypted on 6667.
pub fn broadcast_codec() -> Result<FrameCodec> {
    Ok(FrameCodec::new(
        "broadcast",
        ProtocolVersion::V2,
        LocalCipher::discovery()?,
    ))
}

/// Decode one broadcast datagram.
///
/// Returns `None` for anything that is not a valid discovery frame.
pub fn decode_broadcast(
    codec: &FrameCodec,
    datagram: &[u8],
    source: SocketAddr,
) -> Option<DiscoveredDevice> {
    match codec.decode(datagram) {
        Ok(Some(msg)) => match msg.payload {
            MessagePayload::Discovery(d) => Some(DiscoveredDevice {
                protocol_version: d.version.as_deref().and_then(ProtocolVersion::from_tag),
                encrypted: d.encrypt.unwrap_or(false),
                gateway_id: d.gw_id,
                ip_address: d.ip,
                product_key: d.product_key,
                source,
            }),
            other => {
                debug!("Ignoring {:?} broadcast from {}", other, source);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("Bad broadcast from {}: {}", source, e);
            None
        }
    }
}

/// Listen on the standard broadcast ports for `wait`.
pub async fn discover(wait: Duration) -> Result<Vec<DiscoveredDevice>> {
    let mut sockets = Vec::new();
    for port in [DISCOVERY_PORT_PLAIN, DISCOVERY_PORT_ENCRYPTED] {
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => sockets.push(socket),
            Err(e) => warn!("Cannot listen on UDP {}: {}", port, e),
        }
    }
    if sockets.is_empty() {
        return Err(BridgeError::DiscoveryFailed {
            reason: "no discovery port could be bound".to_string(),
        });
    }
    discover_on(sockets, wait).await
}

/// Collect broadcasts arriving on `sockets` until `wait` elapses.
///
/// Devices are de-duplicated by gateway id; the latest broadcast wins.
pub async fn discover_on(sockets: Vec<UdpSocket>, wait: Duration) -> Result<Vec<DiscoveredDevice>> {
    let codec = broadcast_codec()?;
    let deadline = Instant::now() + wait;
    let (tx, mut rx) = mpsc::channel::<DiscoveredDevice>(64);

    let mut listeners = Vec::new();
    for socket in sockets {
        let tx = tx.clone();
        let codec = codec.clone();
        listeners.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, source) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Discovery receive failed: {}", e);
                        break;
                    }
                };
                if let Some(device) = decode_broadcast(&codec, &buf[..n], source)
                    && tx.send(device).await.is_err()
                {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let mut found: BTreeMap<String, DiscoveredDevice> = BTreeMap::new();
    while let Ok(Some(device)) = timeout_at(deadline, rx.recv()).await {
        if !found.contains_key(&device.gateway_id) {
            info!("Discovered {} at {}", device.gateway_id, device.ip_address);
        }
        found.insert(device.gateway_id.clone(), device);
    }

    for listener in listeners {
        listener.abort();
    }
    Ok(found.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LocalCommand;

    const BROADCAST: &[u8] =
        br#"{"ip":"192.168.1.44","gwId":"bf44","active":2,"ability":0,"mode":0,"encrypt":true,"productKey":"pk","version":"3.3"}"#;

    fn source() -> SocketAddr {
        "192.168.1.44:49154".parse().unwrap()
    }

    #[test]
    fn test_decode_plain_broadcast() {
        let codec = broadcast_codec().unwrap();
        let frame = crate::codec::build_frame(0, LocalCommand::Udp.code(), Some(0), BROADCAST);
        let device = decode_broadcast(&codec, &frame, source()).unwrap();
        assert_eq!(device.gateway_id, "bf44");
        assert_eq!(device.ip_address, "192.168.1.44");
        assert_eq!(device.protocol_version, Some(ProtocolVersion::V2));
        assert!(device.encrypted);
    }

    #[test]
    fn test_decode_encrypted_broadcast() {
        let codec = broadcast_codec().unwrap();
        let frame = codec
            .encode_json(0, LocalCommand::UdpNew, Some(0), BROADCAST)
            .unwrap();
        let device = decode_broadcast(&codec, &frame, source()).unwrap();
        assert_eq!(device.product_key.as_deref(), Some("pk"));
    }

    #[test]
    fn test_decode_garbage_broadcast() {
        let codec = broadcast_codec().unwrap();
        assert!(decode_broadcast(&codec, b"hello", source()).is_none());
    }

    #[tokio::test]
    async fn test_discover_on_dedupes() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = crate::codec::build_frame(0, LocalCommand::Udp.code(), Some(0), BROADCAST);

        let task = tokio::spawn(discover_on(vec![listener], Duration::from_millis(300)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..3 {
            sender.send_to(&frame, addr).await.unwrap();
        }
        let devices = task.await.unwrap().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].gateway_id, "bf44");
    }
}
