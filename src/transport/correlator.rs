// MIT License - Copyright (c) 2021 TJForc

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::debug;

use crate::constants::HEARTBEAT_SEQUENCE;
use crate::error::{BridgeError, Result};
use crate::protocol::{DecodedMessage, LocalCommand};

struct PendingEntry {
    command: LocalCommand,
    created_at: Instant,
    tx: oneshot::Sender<Result<DecodedMessage>>,
}

struct CorrelatorInner {
    /// Last sequence handed out
    sequence: Mutex<u32>,
    /// Outstanding requests by sequence number
    pending: Mutex<HashMap<u32, PendingEntry>>,
}

/// Matches replies to outstanding requests by sequence number.
///
/// Each request is resolved exactly once: by its reply, by its timeout, or
/// by `reject_all()` when the session closes. Replies for unknown or
/// already resolved sequence numbers are ignored.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                sequence: Mutex::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate the next sequence number.
    ///
    /// Skips 0, the heartbeat sentinel and any number still pending.
    pub fn next_sequence(&self) -> u32 {
        let pending = self.inner.pending.lock();
        let mut seq = self.inner.sequence.lock();
        loop {
            *seq = seq.wrapping_add(1);
            if *seq != 0 && *seq != HEARTBEAT_SEQUENCE && !pending.contains_key(&*seq) {
                return *seq;
            }
        }
    }

    /// Allocate a sequence number and register a request under it.
    pub fn begin(&self, command: LocalCommand, wait: Duration) -> PendingReply {
        let sequence = self.next_sequence();
        self.register(sequence, command, wait)
    }

    /// Register a request under `sequence`. The timeout starts now.
    ///
    /// A request already registered under the same number is failed with
    /// `ConnectionClosing` and replaced.
    pub fn register(&self, sequence: u32, command: LocalCommand, wait: Duration) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let replaced = self.inner.pending.lock().insert(
            sequence,
            PendingEntry {
                command,
                created_at,
                tx,
            },
        );
        if let Some(old) = replaced {
            debug!("Sequence {} re-registered, failing previous {:?}", sequence, old.command);
            let _ = old.tx.send(Err(BridgeError::ConnectionClosing));
        }

        PendingReply {
            correlator: self.clone(),
            sequence,
            command,
            deadline: created_at + wait,
            rx: Some(rx),
        }
    }

    /// Route a decoded reply to its pending request.
    ///
    /// Returns `false` when no request is waiting on this sequence number.
    pub fn resolve(&self, message: DecodedMessage) -> bool {
        let Some(entry) = self.inner.pending.lock().remove(&message.sequence) else {
            debug!(
                "Ignoring reply {:?} for unknown sequence {}",
                message.command, message.sequence
            );
            return false;
        };

        debug!(
            "Resolved {:?} (seq {}) after {:?}",
            entry.command,
            message.sequence,
            entry.created_at.elapsed()
        );

        let result = match message.return_code {
            Some(rc) if !rc.is_success() => Err(BridgeError::DeviceRejected(rc)),
            _ => Ok(message),
        };
        let _ = entry.tx.send(result);
        true
    }

    /// Fail one pending request with `error`.
    pub fn fail(&self, sequence: u32, error: BridgeError) -> bool {
        match self.inner.pending.lock().remove(&sequence) {
            Some(entry) => {
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without resolving it.
    pub fn cancel(&self, sequence: u32) -> bool {
        self.inner.pending.lock().remove(&sequence).is_some()
    }

    /// Fail every pending request with `ConnectionClosing`. Returns how many were failed.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<(u32, PendingEntry)> = self.inner.pending.lock().drain().collect();
        let count = drained.len();
        for (sequence, entry) in drained {
            debug!("Rejecting {:?} (seq {}): connection closing", entry.command, sequence);
            let _ = entry.tx.send(Err(BridgeError::ConnectionClosing));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, sequence: u32) -> bool {
        self.inner.pending.lock().contains_key(&sequence)
    }
}

/// Completion handle for one registered request.
///
/// Dropping it before completion removes the request from the table.
pub struct PendingReply {
    correlator: RequestCorrelator,
    sequence: u32,
    command: LocalCommand,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Result<DecodedMessage>>>,
}

impl PendingReply {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn command(&self) -> LocalCommand {
        self.command
    }

    /// Wait for the reply or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Result<DecodedMessage> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(BridgeError::ChannelClosed);
        };

        let outcome = timeout_at(self.deadline, rx).await;
        self.rx = None;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => {
                self.correlator.cancel(self.sequence);
                debug!("Request timeout: {:?} (seq {})", self.command, self.sequence);
                Err(BridgeError::RequestTimeout {
                    command: self.command,
                    sequence: self.sequence,
                })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // Receiver still held: wait() never completed
        if self.rx.is_some() {
            self.correlator.cancel(self.sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReturnCode;
    use crate::protocol::MessagePayload;

    fn reply(sequence: u32) -> DecodedMessage {
        DecodedMessage {
            device_id: "dev".into(),
            command: LocalCommand::DataPointQuery,
            sequence,
            return_code: Some(ReturnCode(0)),
            payload: MessagePayload::Empty,
        }
    }

    #[test]
    fn test_sequences_increase_and_start_at_one() {
        let correlator = RequestCorrelator::new();
        assert_eq!(correlator.next_sequence(), 1);
        assert_eq!(correlator.next_sequence(), 2);
        assert_eq!(correlator.next_sequence(), 3);
    }

    #[test]
    fn test_sentinel_and_zero_never_allocated() {
        let correlator = RequestCorrelator::new();
        *correlator.inner.sequence.lock() = HEARTBEAT_SEQUENCE - 1;
        assert_eq!(correlator.next_sequence(), HEARTBEAT_SEQUENCE + 1);

        *correlator.inner.sequence.lock() = u32::MAX;
        assert_eq!(correlator.next_sequence(), 1);
    }

    #[tokio::test]
    async fn test_pending_sequence_skipped_after_wrap() {
        let correlator = RequestCorrelator::new();
        let _held = correlator.register(1, LocalCommand::Control, Duration::from_secs(5));
        *correlator.inner.sequence.lock() = u32::MAX;
        assert_eq!(correlator.next_sequence(), 2);
    }

    #[tokio::test]
    async fn test_resolve_matches_sequence() {
        let correlator = RequestCorrelator::new();
        let first = correlator.begin(LocalCommand::DataPointQuery, Duration::from_secs(5));
        let second = correlator.begin(LocalCommand::DataPointQuery, Duration::from_secs(5));
        let (s1, s2) = (first.sequence(), second.sequence());
        assert_ne!(s1, s2);

        // Out of order: second resolves first
        assert!(correlator.resolve(reply(s2)));
        assert!(correlator.is_pending(s1));
        assert_eq!(second.wait().await.unwrap().sequence, s2);

        assert!(correlator.resolve(reply(s1)));
        assert_eq!(first.wait().await.unwrap().sequence, s1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_reply_ignored() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.begin(LocalCommand::Control, Duration::from_secs(5));
        let seq = pending.sequence();
        assert!(correlator.resolve(reply(seq)));
        assert!(!correlator.resolve(reply(seq)));
        assert!(pending.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_reply_ignored() {
        let correlator = RequestCorrelator::new();
        assert!(!correlator.resolve(reply(77)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_late_reply_ignored() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.begin(LocalCommand::DataPointQuery, Duration::from_secs(5));
        let seq = pending.sequence();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::RequestTimeout {
                command: LocalCommand::DataPointQuery,
                ..
            }
        ));
        assert!(!correlator.is_pending(seq));
        assert!(!correlator.resolve(reply(seq)));
    }

    #[tokio::test]
    async fn test_reject_all() {
        let correlator = RequestCorrelator::new();
        let a = correlator.begin(LocalCommand::Control, Duration::from_secs(5));
        let b = correlator.begin(LocalCommand::DataPointQuery, Duration::from_secs(5));
        assert_eq!(correlator.reject_all(), 2);
        assert_eq!(correlator.pending_count(), 0);
        assert!(matches!(a.wait().await, Err(BridgeError::ConnectionClosing)));
        assert!(matches!(b.wait().await, Err(BridgeError::ConnectionClosing)));
        assert_eq!(correlator.reject_all(), 0);
    }

    #[tokio::test]
    async fn test_rejected_return_code() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.begin(LocalCommand::Control, Duration::from_secs(5));
        let mut msg = reply(pending.sequence());
        msg.return_code = Some(ReturnCode(1));
        correlator.resolve(msg);
        assert!(matches!(
            pending.wait().await,
            Err(BridgeError::DeviceRejected(ReturnCode(1)))
        ));
    }

    #[tokio::test]
    async fn test_drop_removes_entry() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.begin(LocalCommand::Control, Duration::from_secs(5));
        let seq = pending.sequence();
        drop(pending);
        assert!(!correlator.is_pending(seq));
    }

    #[tokio::test]
    async fn test_fail_single_request() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.begin(LocalCommand::Control, Duration::from_secs(5));
        assert!(correlator.fail(pending.sequence(), BridgeError::NotConnected));
        assert!(matches!(pending.wait().await, Err(BridgeError::NotConnected)));
    }
}
