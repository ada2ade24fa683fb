// MIT License - Copyright (c) 2021 TJForc

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at, timeout};
use tracing::{debug, error, info, warn};

use crate::codec::{FrameBuffer, FrameCodec};
use crate::config::SessionConfig;
use crate::constants::{EVENT_CHANNEL_CAPACITY, HEARTBEAT_SEQUENCE};
use crate::error::{BridgeError, Result};
use crate::event::{EventReceiver, EventSender, SessionEvent, event_channel};
use crate::protocol::{
    DataPoint, DataPointValue, DecodedMessage, LocalCommand, MessagePayload, RequestArgs,
    RequestContext, RequestPayload,
};
use crate::transport::correlator::{PendingReply, RequestCorrelator};

/// Connection state of a device session.
///
/// `Lost` and `Disconnected` record how the last connection ended; like
/// `Idle`, both accept a new `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Lost,
    Disconnected,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub last_connect_attempt: Option<Instant>,
    pub connected_at: Option<Instant>,
    pub last_heartbeat: Option<Instant>,
    pub disconnected_at: Option<Instant>,
    pub lost_at: Option<Instant>,
    pub pending_requests: usize,
}

struct Timeline {
    state: SessionState,
    last_connect_attempt: Option<Instant>,
    connected_at: Option<Instant>,
    last_heartbeat: Option<Instant>,
    disconnected_at: Option<Instant>,
    lost_at: Option<Instant>,
    /// Incremented on every attach; tasks of an older connection carry a stale id
    connection_id: u64,
    /// Signals the reader and heartbeat tasks of the live connection
    shutdown: Option<watch::Sender<bool>>,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct SessionInner {
    config: SessionConfig,
    codec: FrameCodec,
    ctx: RequestContext,
    correlator: RequestCorrelator,
    timeline: Mutex<Timeline>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    event_tx: EventSender,
}

/// One connection to a device.
///
/// The session never reconnects on its own; the owner decides when to call
/// `connect()` again.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    /// Create an idle session. Fails if the local key is unusable.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let codec = FrameCodec::from_config(&config)?;
        let ctx = RequestContext::new(config.device_id.clone(), config.gateway_id.clone());
        let (event_tx, _) = event_channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                codec,
                ctx,
                correlator: RequestCorrelator::new(),
                timeline: Mutex::new(Timeline {
                    state: SessionState::Idle,
                    last_connect_attempt: None,
                    connected_at: None,
                    last_heartbeat: None,
                    disconnected_at: None,
                    lost_at: None,
                    connection_id: 0,
                    shutdown: None,
                }),
                writer: tokio::sync::Mutex::new(None),
                event_tx,
            }),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.config.device_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.event_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        let t = self.inner.timeline.lock();
        SessionStatus {
            state: t.state,
            last_connect_attempt: t.last_connect_attempt,
            connected_at: t.connected_at,
            last_heartbeat: t.last_heartbeat,
            disconnected_at: t.disconnected_at,
            lost_at: t.lost_at,
            pending_requests: self.inner.correlator.pending_count(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.timeline.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Open a TCP connection to the device.
    ///
    /// On failure the session returns to `Idle` and an `Error` event is
    /// emitted; no retry is attempted.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut t = self.inner.timeline.lock();
            match t.state {
                SessionState::Connected | SessionState::Connecting => {
                    debug!("{}: connect() while {:?}, ignoring", self.device_id(), t.state);
                    return Ok(());
                }
                _ => {}
            }
            t.state = SessionState::Connecting;
            t.last_connect_attempt = Some(Instant::now());
        }

        let address = self.inner.config.address();
        info!("Connecting to device {} at {}", self.device_id(), address);

        let outcome = timeout(self.inner.config.connect_timeout, TcpStream::connect(&address)).await;
        let error = match outcome {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed: {}", e);
                }
                self.attach(stream).await;
                return Ok(());
            }
            Ok(Err(e)) => BridgeError::Io(e),
            Err(_) => BridgeError::ConnectionTimeout,
        };

        error!("Connect to {} failed: {}", address, error);
        self.inner.timeline.lock().state = SessionState::Idle;
        self.emit(SessionEvent::Error {
            device_id: self.device_id().to_string(),
            message: error.to_string(),
        });
        Err(error)
    }

    /// Start the session over an already connected byte stream.
    ///
    /// Spawns the reader and heartbeat tasks for this connection.
    pub async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.timeline.lock().shutdown.is_some() {
            self.close(None, SessionState::Disconnected).await;
        }

        let (reader, writer) = tokio::io::split(stream);
        *self.inner.writer.lock().await = Some(Box::new(writer));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connection_id = {
            let mut t = self.inner.timeline.lock();
            let now = Instant::now();
            t.connection_id += 1;
            t.state = SessionState::Connected;
            t.connected_at = Some(now);
            t.last_heartbeat = Some(now);
            t.lost_at = None;
            t.disconnected_at = None;
            t.shutdown = Some(shutdown_tx);
            t.connection_id
        };

        tokio::spawn(run_reader(
            self.clone(),
            reader,
            shutdown_rx.clone(),
            connection_id,
        ));
        tokio::spawn(run_heartbeat(self.clone(), shutdown_rx, connection_id));

        info!("Connected to device {}", self.device_id());
        self.emit(SessionEvent::Connected {
            device_id: self.device_id().to_string(),
        });
    }

    /// Close the connection and fail all pending requests. Safe to call in any state.
    pub async fn disconnect(&self) {
        if !self.close(None, SessionState::Disconnected).await {
            debug!("{}: disconnect() with no live connection", self.device_id());
            self.inner.correlator.reject_all();
        }
    }

    /// Send a correlated request and return its completion handle.
    pub async fn send(&self, command: LocalCommand, args: RequestArgs) -> Result<PendingReply> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let payload = self.payload(command, args);
        let pending = self
            .inner
            .correlator
            .begin(command, self.inner.config.request_timeout);
        let frame = self.inner.codec.encode(pending.sequence(), command, &payload)?;
        self.send_frame(&frame).await?;
        debug!("{}: sent {:?} (seq {})", self.device_id(), command, pending.sequence());
        Ok(pending)
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, command: LocalCommand, args: RequestArgs) -> Result<DecodedMessage> {
        self.send(command, args).await?.wait().await
    }

    /// Read all data points.
    pub async fn read_states(&self) -> Result<Vec<DataPoint>> {
        let reply = self
            .request(LocalCommand::DataPointQuery, RequestArgs::default())
            .await?;
        Ok(reply.data_points().to_vec())
    }

    /// Set data points and wait for the device to acknowledge.
    pub async fn write_states(&self, dps: BTreeMap<String, DataPointValue>) -> Result<()> {
        self.request(LocalCommand::Control, RequestArgs::control(dps))
            .await
            .map(|_| ())
    }

    /// Ask the device to re-report `dp_ids`.
    ///
    /// Devices answer with status reports rather than a correlated reply,
    /// so this only sends.
    pub async fn refresh(&self, dp_ids: Vec<u32>) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let payload = self.payload(LocalCommand::DataPointRefresh, RequestArgs::refresh(dp_ids));
        let sequence = self.inner.correlator.next_sequence();
        let frame = self
            .inner
            .codec
            .encode(sequence, LocalCommand::DataPointRefresh, &payload)?;
        self.send_frame(&frame).await
    }

    /// Scan wifi networks visible to the device.
    pub async fn query_wifi(&self) -> Result<Vec<String>> {
        let reply = self
            .request(LocalCommand::QueryWifi, RequestArgs::default())
            .await?;
        match reply.payload {
            MessagePayload::WifiScan(ssids) => Ok(ssids),
            _ => Ok(Vec::new()),
        }
    }

    fn payload(&self, command: LocalCommand, args: RequestArgs) -> RequestPayload {
        RequestPayload::for_command(command, &self.inner.ctx, args, chrono::Utc::now().timestamp())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.event_tx.send(event);
    }

    fn connection_id(&self) -> u64 {
        self.inner.timeline.lock().connection_id
    }

    /// Write one frame. A write failure closes the connection.
    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let connection = self.connection_id();
        let result = {
            let mut guard = self.inner.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(BridgeError::NotConnected);
            };
            let write = async {
                writer.write_all(frame).await?;
                writer.flush().await
            };
            match timeout(self.inner.config.request_timeout, write).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                )),
            }
        };

        if let Err(e) = result {
            error!("{}: write failed: {}", self.device_id(), e);
            self.emit(SessionEvent::Error {
                device_id: self.device_id().to_string(),
                message: e.to_string(),
            });
            self.close(Some(connection), SessionState::Disconnected).await;
            return Err(BridgeError::Io(e));
        }
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let payload = self.payload(LocalCommand::HeartBeat, RequestArgs::default());
        let frame = self
            .inner
            .codec
            .encode(HEARTBEAT_SEQUENCE, LocalCommand::HeartBeat, &payload)?;
        debug!("{}: heartbeat", self.device_id());
        self.send_frame(&frame).await
    }

    fn heartbeat_expired(&self) -> bool {
        let t = self.inner.timeline.lock();
        match t.last_heartbeat {
            Some(last) => last.elapsed() > self.inner.config.heartbeat_timeout,
            None => false,
        }
    }

    /// Decode one frame and route the result.
    fn handle_frame(&self, frame: &[u8]) {
        match self.inner.codec.decode(frame) {
            Ok(Some(message)) => self.route(message),
            Ok(None) => {}
            Err(e) => error!("{}: dropping frame: {}", self.device_id(), e),
        }
    }

    fn route(&self, message: DecodedMessage) {
        if message.sequence == HEARTBEAT_SEQUENCE {
            debug!("{}: heartbeat reply", self.device_id());
            self.inner.timeline.lock().last_heartbeat = Some(Instant::now());
            return;
        }

        if self.inner.correlator.is_pending(message.sequence) {
            self.inner.correlator.resolve(message);
            return;
        }

        match message.command {
            LocalCommand::Status => {
                debug!(
                    "{}: status report with {} data points",
                    self.device_id(),
                    message.data_points().len()
                );
                self.emit(SessionEvent::StatusReport(message));
            }
            LocalCommand::HeartBeat => {
                self.inner.timeline.lock().last_heartbeat = Some(Instant::now());
            }
            _ => {
                debug!(
                    "{}: unsolicited {:?} (seq {})",
                    self.device_id(),
                    message.command,
                    message.sequence
                );
                self.emit(SessionEvent::Unsolicited(message));
            }
        }
    }

    /// Tear down the live connection.
    ///
    /// With `Some(id)`, only closes if that connection is still the live one.
    /// Returns `false` if there was nothing to close.
    async fn close(&self, connection: Option<u64>, outcome: SessionState) -> bool {
        let shutdown = {
            let mut t = self.inner.timeline.lock();
            if connection.is_some_and(|id| id != t.connection_id) {
                return false;
            }
            let Some(shutdown) = t.shutdown.take() else {
                return false;
            };
            let now = Instant::now();
            t.state = outcome;
            t.disconnected_at = Some(now);
            if outcome == SessionState::Lost {
                t.lost_at = Some(now);
            }
            shutdown
        };

        let _ = shutdown.send(true);
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let rejected = self.inner.correlator.reject_all();
        let device_id = self.device_id().to_string();
        if outcome == SessionState::Lost {
            warn!("Device {} lost ({} pending requests rejected)", device_id, rejected);
            self.emit(SessionEvent::Lost { device_id });
        } else {
            info!("Device {} disconnected ({} pending requests rejected)", device_id, rejected);
            self.emit(SessionEvent::Disconnected { device_id });
        }
        true
    }
}

async fn run_reader<R>(
    session: DeviceSession,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
    connection: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    let mut frames = FrameBuffer::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{}: connection closed by device", session.device_id());
                    session.close(Some(connection), SessionState::Disconnected).await;
                    break;
                }
                Ok(n) => {
                    for frame in frames.push(&buf[..n]) {
                        session.handle_frame(&frame);
                    }
                }
                Err(e) => {
                    warn!("{}: read error: {}", session.device_id(), e);
                    session.emit(SessionEvent::Error {
                        device_id: session.device_id().to_string(),
                        message: e.to_string(),
                    });
                    session.close(Some(connection), SessionState::Disconnected).await;
                    break;
                }
            }
        }
    }
    debug!("{}: reader task exiting", session.device_id());
}

async fn run_heartbeat(session: DeviceSession, mut shutdown: watch::Receiver<bool>, connection: u64) {
    let period = session.config().heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if session.heartbeat_expired() {
                    session.close(Some(connection), SessionState::Lost).await;
                    break;
                }
                if let Err(e) = session.send_heartbeat().await {
                    warn!("{}: heartbeat failed: {}", session.device_id(), e);
                }
            }
        }
    }
    debug!("{}: heartbeat task exiting", session.device_id());
}
