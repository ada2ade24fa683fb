// Device session tests against an in-memory device simulator.
//
// The simulator sits on the far end of a `tokio::io::duplex` pipe, decodes
// request frames with the same codec the session uses and answers with
// hand-built replies.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use local_device_bridge::constants::HEARTBEAT_SEQUENCE;
use local_device_bridge::protocol::MessagePayload;
use local_device_bridge::{
    BridgeError, DataPointValue, DecodedMessage, DeviceSession, FrameBuffer, FrameCodec,
    LocalCommand, ProtocolVersion, SessionConfig, SessionEvent, SessionState,
};

const KEY: &str = "0123456789abcdef";

fn config(version: ProtocolVersion) -> SessionConfig {
    SessionConfig::builder()
        .device_id("bf0123456789abcdef")
        .ip_address("127.0.0.1")
        .local_key(KEY)
        .protocol_version(version)
        .build()
}

struct FakeDevice {
    codec: FrameCodec,
    stream: DuplexStream,
    frames: FrameBuffer,
    backlog: Vec<Vec<u8>>,
}

impl FakeDevice {
    /// Attach a new session to a simulated device.
    async fn start(version: ProtocolVersion) -> (DeviceSession, FakeDevice) {
        Self::start_with(config(version)).await
    }

    async fn start_with(config: SessionConfig) -> (DeviceSession, FakeDevice) {
        let codec = FrameCodec::from_config(&config).unwrap();
        let session = DeviceSession::new(config).unwrap();
        let (near, far) = tokio::io::duplex(16 * 1024);
        session.attach(near).await;
        (
            session,
            FakeDevice {
                codec,
                stream: far,
                frames: FrameBuffer::new(),
                backlog: Vec::new(),
            },
        )
    }

    /// Next request frame sent by the session, heartbeats included.
    async fn next_frame(&mut self) -> DecodedMessage {
        loop {
            if !self.backlog.is_empty() {
                let frame = self.backlog.remove(0);
                if let Some(msg) = self.codec.decode(&frame).unwrap() {
                    return msg;
                }
                continue;
            }
            let mut buf = [0u8; 2048];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "session closed the stream");
            self.backlog.extend(self.frames.push(&buf[..n]));
        }
    }

    /// Next request that is not a heartbeat.
    async fn next_request(&mut self) -> DecodedMessage {
        loop {
            let msg = self.next_frame().await;
            if msg.sequence != HEARTBEAT_SEQUENCE {
                return msg;
            }
        }
    }

    async fn send(&mut self, sequence: u32, command: LocalCommand, rc: Option<u32>, json: &[u8]) {
        let frame = self.codec.encode_json(sequence, command, rc, json).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn reply(&mut self, request: &DecodedMessage, json: serde_json::Value) {
        let body = serde_json::to_vec(&json).unwrap();
        self.send(request.sequence, request.command, Some(0), &body).await;
    }
}

async fn next_event(events: &mut local_device_bridge::EventReceiver) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("no event")
        .expect("event channel closed")
}

#[tokio::test]
async fn read_states_round_trip() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;
    assert_eq!(session.state(), SessionState::Connected);

    let reader = tokio::spawn({
        let session = session.clone();
        async move { session.read_states().await }
    });

    let request = device.next_request().await;
    assert_eq!(request.command, LocalCommand::DataPointQuery);
    device
        .reply(&request, json!({"devId": "bf0123456789abcdef", "dps": {"1": true, "2": 42}}))
        .await;

    let mut points = reader.await.unwrap().unwrap();
    points.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].value, DataPointValue::Bool(true));
    assert_eq!(points[1].value, DataPointValue::Integer(42));
    assert_eq!(session.status().pending_requests, 0);
}

#[tokio::test]
async fn v1_control_carries_data_points() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V1).await;

    let writer = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .write_states([("1".to_string(), DataPointValue::Bool(true))].into())
                .await
        }
    });

    let request = device.next_request().await;
    assert_eq!(request.command, LocalCommand::Control);
    match &request.payload {
        MessagePayload::DataPoints(dps) => {
            assert_eq!(dps.len(), 1);
            assert_eq!(dps[0].id, "1");
            assert_eq!(dps[0].value, DataPointValue::Bool(true));
        }
        other => panic!("unexpected payload {other:?}"),
    }
    device.send(request.sequence, LocalCommand::Control, Some(0), b"").await;

    writer.await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_reply_fails_request() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;

    let writer = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .write_states([("2".to_string(), DataPointValue::Integer(5))].into())
                .await
        }
    });

    let request = device.next_request().await;
    device.send(request.sequence, LocalCommand::Control, Some(1), b"").await;

    assert!(matches!(
        writer.await.unwrap(),
        Err(BridgeError::DeviceRejected(rc)) if rc.0 == 1
    ));
}

#[tokio::test]
async fn reply_split_across_writes_resolves() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;

    let reader = tokio::spawn({
        let session = session.clone();
        async move { session.read_states().await }
    });

    let request = device.next_request().await;
    let frame = device
        .codec
        .encode_json(request.sequence, request.command, Some(0), br#"{"dps":{"3":"auto"}}"#)
        .unwrap();
    let (head, tail) = frame.split_at(10);
    device.stream.write_all(head).await.unwrap();
    device.stream.flush().await.unwrap();
    tokio::task::yield_now().await;
    device.stream.write_all(tail).await.unwrap();

    let points = reader.await.unwrap().unwrap();
    assert_eq!(points[0].value, DataPointValue::String("auto".into()));
}

#[tokio::test]
async fn sequence_numbers_increase() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;

    let mut last = 0;
    for _ in 0..3 {
        let reader = tokio::spawn({
            let session = session.clone();
            async move { session.read_states().await }
        });
        let request = device.next_request().await;
        assert!(request.sequence > last);
        assert_ne!(request.sequence, HEARTBEAT_SEQUENCE);
        last = request.sequence;
        device.reply(&request, json!({"dps": {}})).await;
        reader.await.unwrap().unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_then_late_reply_is_unsolicited() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;
    let mut events = session.subscribe();

    let reader = tokio::spawn({
        let session = session.clone();
        async move { session.read_states().await }
    });
    let request = device.next_request().await;

    let result = reader.await.unwrap();
    assert!(matches!(
        result,
        Err(BridgeError::RequestTimeout { command: LocalCommand::DataPointQuery, sequence }) if sequence == request.sequence
    ));
    assert_eq!(session.status().pending_requests, 0);

    device.reply(&request, json!({"dps": {"1": false}})).await;
    match next_event(&mut events).await {
        SessionEvent::Unsolicited(msg) => assert_eq!(msg.sequence, request.sequence),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn status_report_is_published() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;
    let mut events = session.subscribe();

    device
        .send(0, LocalCommand::Status, Some(0), br#"{"devId":"bf0123456789abcdef","dps":{"1":true}}"#)
        .await;

    match next_event(&mut events).await {
        SessionEvent::StatusReport(msg) => {
            assert_eq!(msg.data_points().len(), 1);
            assert_eq!(msg.data_points()[0].value, DataPointValue::Bool(true));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn corrupted_frame_is_dropped() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;

    let reader = tokio::spawn({
        let session = session.clone();
        async move { session.read_states().await }
    });
    let request = device.next_request().await;

    let mut bad = device
        .codec
        .encode_json(request.sequence, request.command, Some(0), br#"{"dps":{"1":1}}"#)
        .unwrap();
    let crc_at = bad.len() - 8;
    bad[crc_at] ^= 0xFF;
    device.stream.write_all(&bad).await.unwrap();
    assert!(session.correlator().is_pending(request.sequence));

    device.reply(&request, json!({"dps": {"1": 2}})).await;
    let points = reader.await.unwrap().unwrap();
    assert_eq!(points[0].value, DataPointValue::Integer(2));
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn missing_heartbeats_lose_the_session() {
    // Outstanding requests must outlive the heartbeat deadline
    let mut config = config(ProtocolVersion::V2);
    config.request_timeout = Duration::from_secs(60);
    let (session, mut device) = FakeDevice::start_with(config).await;
    let mut events = session.subscribe();

    let pending = session
        .send(LocalCommand::DataPointQuery, Default::default())
        .await
        .unwrap();
    let waiter = tokio::spawn(pending.wait());

    let request = device.next_request().await;
    assert_eq!(request.command, LocalCommand::DataPointQuery);
    let heartbeat = device.next_frame().await;
    assert_eq!(heartbeat.sequence, HEARTBEAT_SEQUENCE);
    assert_eq!(heartbeat.command, LocalCommand::HeartBeat);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Lost { .. }));
    let status = session.status();
    assert_eq!(status.state, SessionState::Lost);
    assert!(status.lost_at.is_some());
    assert!(status.disconnected_at.is_some());
    assert_eq!(status.pending_requests, 0);

    assert!(matches!(waiter.await.unwrap(), Err(BridgeError::ConnectionClosing)));
}

#[tokio::test(start_paused = true)]
async fn answered_heartbeats_keep_the_session() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;

    let responder = tokio::spawn(async move {
        loop {
            let frame = device.next_frame().await;
            if frame.sequence == HEARTBEAT_SEQUENCE {
                device
                    .send(HEARTBEAT_SEQUENCE, LocalCommand::HeartBeat, Some(0), b"")
                    .await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.state(), SessionState::Connected);
    responder.abort();
}

#[tokio::test]
async fn disconnect_rejects_pending_and_is_idempotent() {
    let (session, mut device) = FakeDevice::start(ProtocolVersion::V2).await;
    let mut events = session.subscribe();

    let pending = session
        .send(LocalCommand::DataPointQuery, Default::default())
        .await
        .unwrap();
    let request = device.next_request().await;
    assert_eq!(request.sequence, pending.sequence());

    session.disconnect().await;
    assert!(matches!(pending.wait().await, Err(BridgeError::ConnectionClosing)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected { .. }));

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(events.try_recv().is_err());

    assert!(matches!(
        session.read_states().await,
        Err(BridgeError::NotConnected)
    ));
}

#[tokio::test]
async fn device_closing_the_stream_disconnects() {
    let (session, device) = FakeDevice::start(ProtocolVersion::V2).await;
    let mut events = session.subscribe();

    let pending = session
        .send(LocalCommand::DataPointQuery, Default::default())
        .await
        .unwrap();
    drop(device);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected { .. }));
    assert!(matches!(pending.wait().await, Err(BridgeError::ConnectionClosing)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn reattach_after_disconnect() {
    let (session, _device) = FakeDevice::start(ProtocolVersion::V2).await;
    session.disconnect().await;

    let (near, _far) = tokio::io::duplex(1024);
    session.attach(near).await;
    assert_eq!(session.state(), SessionState::Connected);
    let status = session.status();
    assert!(status.disconnected_at.is_none());
    assert!(status.connected_at.is_some());
}
