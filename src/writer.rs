// MIT License - Copyright (c) 2021 TJForc

//! Debounced property write scheduler.
//!
//! Every tick the writer looks at the next device not yet visited in the
//! current sweep and dispatches at most one property write. A full sweep
//! without a write starts the next sweep from the beginning.
//!
//! In event mode the sweep is replaced by change notifications; both modes
//! share `evaluate_property`, so debounce and pending handling are the same.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval};
use tracing::{debug, info, warn};

use crate::config::{WriterConfig, WriterMode};
use crate::directory::{
    ChannelRecord, ConnectorMessage, DeviceConnectionState, DeviceRecord, Directory,
    MessageQueue, PropertyRecord, StateRead, StateStore, StateUpdate,
};
use crate::error::{BridgeError, Result};
use crate::protocol::DataPointValue;

/// Everything needed to address one property on the wire.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub device: DeviceRecord,
    pub channel: ChannelRecord,
    pub property: PropertyRecord,
}

/// Pushes a single property value to its device.
pub trait PropertyTransport: Send + Sync + 'static {
    fn write_property(
        &self,
        target: &WriteTarget,
        value: DataPointValue,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A write was dispatched; the tick ended early
    Dispatched,
    /// A state read is still in flight; retry on a later tick
    Aborted,
    /// Nothing to write anywhere; the sweep was reset
    Idle,
}

/// Result of evaluating one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Dispatched,
    /// State read reported fetching
    Abort,
    /// Inside the debounce window
    Debounced,
    /// An earlier write is still in flight
    Pending,
    /// Nothing to do (not settable, no expected value, orphaned or already matching)
    Skipped,
}

#[derive(Default)]
struct Schedule {
    roster: Vec<String>,
    processed: HashSet<String>,
    last_attempt: HashMap<String, Instant>,
    /// When the writer first saw each property pending
    pending_seen: HashMap<String, Instant>,
    /// Event-mode notifications waiting for debounce or a fetch
    deferred: BTreeSet<String>,
}

struct WriterInner<T> {
    config: WriterConfig,
    directory: Arc<dyn Directory>,
    states: Arc<dyn StateStore>,
    queue: Arc<dyn MessageQueue>,
    transport: Arc<T>,
    schedule: Mutex<Schedule>,
    notify_tx: mpsc::UnboundedSender<String>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Property write scheduler.
pub struct PropertyWriter<T> {
    inner: Arc<WriterInner<T>>,
}

impl<T> Clone for PropertyWriter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: PropertyTransport> PropertyWriter<T> {
    pub fn new(
        config: WriterConfig,
        directory: Arc<dyn Directory>,
        states: Arc<dyn StateStore>,
        queue: Arc<dyn MessageQueue>,
        transport: Arc<T>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(WriterInner {
                config,
                directory,
                states,
                queue,
                transport,
                schedule: Mutex::new(Schedule::default()),
                notify_tx,
                notify_rx: Mutex::new(Some(notify_rx)),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.inner.config
    }

    /// Re-read the device roster from the directory and restart the sweep.
    pub fn reload(&self) {
        let roster: Vec<String> = self
            .inner
            .directory
            .devices()
            .into_iter()
            .map(|d| d.id)
            .collect();
        debug!("Writer roster: {} devices", roster.len());
        let mut schedule = self.inner.schedule.lock();
        schedule.roster = roster;
        schedule.processed.clear();
    }

    /// Start the scheduler loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let Some(notify_rx) = self.inner.notify_rx.lock().take() else {
            debug!("Writer already started");
            return;
        };
        let (tx, rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(tx);

        self.reload();
        info!("Property writer started ({:?} mode)", self.inner.config.mode);
        tokio::spawn(self.clone().run(rx, notify_rx));
    }

    /// Stop the scheduler loop.
    pub fn stop(&self) {
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(true);
            info!("Property writer stopped");
        }
    }

    /// Report that a property's expected value changed.
    pub fn notify(&self, property_id: &str) {
        if self.inner.notify_tx.send(property_id.to_string()).is_err() {
            debug!("Writer gone, dropping notification for {}", property_id);
        }
    }

    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        mut notifications: mpsc::UnboundedReceiver<String>,
    ) {
        let mut ticker = interval(self.inner.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(property_id) = notifications.recv() => {
                    self.handle_notification(&property_id);
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        debug!("Writer loop exiting");
    }

    /// Run one scheduler step.
    pub fn tick(&self) -> TickOutcome {
        match self.inner.config.mode {
            WriterMode::Periodic => self.sweep_step(),
            WriterMode::Event => self.retry_deferred(),
        }
    }

    fn sweep_step(&self) -> TickOutcome {
        let roster = self.inner.schedule.lock().roster.clone();

        for device_id in roster {
            {
                let mut schedule = self.inner.schedule.lock();
                if !schedule.processed.insert(device_id.clone()) {
                    continue;
                }
            }

            match self.process_device(&device_id) {
                Evaluation::Dispatched => return TickOutcome::Dispatched,
                Evaluation::Abort => {
                    // Revisit this device on the next tick
                    self.inner.schedule.lock().processed.remove(&device_id);
                    return TickOutcome::Aborted;
                }
                Evaluation::Debounced | Evaluation::Pending | Evaluation::Skipped => {}
            }
        }

        self.inner.schedule.lock().processed.clear();
        TickOutcome::Idle
    }

    fn process_device(&self, device_id: &str) -> Evaluation {
        if self.inner.directory.find_device(device_id).is_none() {
            debug!("Device {} left the directory", device_id);
            return Evaluation::Skipped;
        }

        for property in self.inner.directory.find_properties_for_device(device_id) {
            match self.evaluate_property(&property) {
                Evaluation::Dispatched => return Evaluation::Dispatched,
                Evaluation::Abort => return Evaluation::Abort,
                Evaluation::Debounced | Evaluation::Pending | Evaluation::Skipped => {}
            }
        }
        Evaluation::Skipped
    }

    fn handle_notification(&self, property_id: &str) {
        let Some(property) = self.inner.directory.find_property(property_id) else {
            debug!("Notification for unknown property {}", property_id);
            return;
        };
        // Pending writes stay deferred so a value set mid-flight is written once they settle
        match self.evaluate_property(&property) {
            Evaluation::Debounced | Evaluation::Pending | Evaluation::Abort => {
                self.inner
                    .schedule
                    .lock()
                    .deferred
                    .insert(property_id.to_string());
            }
            Evaluation::Dispatched | Evaluation::Skipped => {}
        }
    }

    fn retry_deferred(&self) -> TickOutcome {
        let deferred: Vec<String> = self.inner.schedule.lock().deferred.iter().cloned().collect();
        for property_id in deferred {
            self.inner.schedule.lock().deferred.remove(&property_id);
            let Some(property) = self.inner.directory.find_property(&property_id) else {
                continue;
            };
            match self.evaluate_property(&property) {
                Evaluation::Dispatched => return TickOutcome::Dispatched,
                Evaluation::Abort => {
                    self.inner.schedule.lock().deferred.insert(property_id);
                    return TickOutcome::Aborted;
                }
                Evaluation::Debounced | Evaluation::Pending => {
                    self.inner.schedule.lock().deferred.insert(property_id);
                }
                Evaluation::Skipped => {}
            }
        }
        TickOutcome::Idle
    }

    /// Decide whether `property` needs a write and dispatch it.
    pub fn evaluate_property(&self, property: &PropertyRecord) -> Evaluation {
        let inner = &self.inner;

        let (Some(device), Some(channel)) = (
            inner.directory.find_device(&property.device),
            inner.directory.find_channel(&property.channel),
        ) else {
            debug!("Property {} has no device or channel, skipping", property.id);
            return Evaluation::Skipped;
        };

        if !property.settable {
            return Evaluation::Skipped;
        }

        let now = Instant::now();
        if let Some(last) = inner.schedule.lock().last_attempt.get(&property.id)
            && now.duration_since(*last) < inner.config.debounce
        {
            return Evaluation::Debounced;
        }

        let state = match inner.states.read(property) {
            StateRead::Ready(state) => state,
            StateRead::Fetching => return Evaluation::Abort,
        };

        let Some(expected) = state.expected.clone() else {
            return Evaluation::Skipped;
        };

        if state.is_pending() {
            let first_seen = *inner
                .schedule
                .lock()
                .pending_seen
                .entry(property.id.clone())
                .or_insert(now);
            if now.duration_since(first_seen) < inner.config.pending_timeout {
                return Evaluation::Pending;
            }

            warn!(
                "Write of {} on {} stayed pending too long, giving up",
                property.identifier, device.id
            );
            inner.schedule.lock().pending_seen.remove(&property.id);
            let state = inner
                .states
                .set(property, StateUpdate::new().expected(None).clear_pending());
            inner
                .queue
                .append(ConnectorMessage::property_state(property, &state));
            return Evaluation::Skipped;
        }

        inner
            .schedule
            .lock()
            .last_attempt
            .insert(property.id.clone(), now);

        if state.actual.as_ref() == Some(&expected) {
            debug!("{} on {} already at {}", property.identifier, device.id, expected);
            let state = inner
                .states
                .set(property, StateUpdate::new().expected(None).clear_pending());
            inner
                .queue
                .append(ConnectorMessage::property_state(property, &state));
            return Evaluation::Skipped;
        }

        let state = inner
            .states
            .set(property, StateUpdate::new().pending_since(Utc::now()));
        inner
            .schedule
            .lock()
            .pending_seen
            .insert(property.id.clone(), now);
        inner
            .queue
            .append(ConnectorMessage::property_state(property, &state));

        debug!(
            "Writing {}={} to device {}",
            property.identifier, expected, device.id
        );
        let target = WriteTarget {
            device,
            channel,
            property: property.clone(),
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.transport.write_property(&target, expected.clone()).await;
            inner.complete(&target, expected, result);
        });

        Evaluation::Dispatched
    }
}

impl<T> WriterInner<T> {
    /// Settle a dispatched write. Pending is always cleared.
    fn complete(&self, target: &WriteTarget, value: DataPointValue, result: Result<()>) {
        let property = &target.property;
        self.schedule.lock().pending_seen.remove(&property.id);

        // A newer expected value set while the write was in flight is kept
        let superseded = match self.states.read(property) {
            StateRead::Ready(state) => state.expected.is_some() && state.expected.as_ref() != Some(&value),
            StateRead::Fetching => false,
        };
        let mut update = StateUpdate::new().clear_pending();
        if !superseded {
            update = update.expected(None);
        } else if self.config.mode == WriterMode::Event {
            let _ = self.notify_tx.send(property.id.clone());
        }

        match result {
            Ok(()) => {
                debug!("Wrote {}={} to {}", property.identifier, value, target.device.id);
                update = update.actual(value);
            }
            Err(e) => {
                warn!(
                    "Write of {} to {} failed: {}",
                    property.identifier, target.device.id, e
                );
                self.queue.append(ConnectorMessage::WriteFailed {
                    device: target.device.id.clone(),
                    property: property.id.clone(),
                    reason: e.to_string(),
                });
                if matches!(e, BridgeError::NotConfigured { .. }) {
                    self.queue.append(ConnectorMessage::connection_state(
                        &target.device.id,
                        DeviceConnectionState::Alert,
                    ));
                }
            }
        }

        let state = self.states.set(property, update);
        self.queue
            .append(ConnectorMessage::property_state(property, &state));
    }
}
