//! Command channel
//!
//! Serializes commands to the adapter so that exactly one is awaiting a
//! response at any time, and pairs each command with the next framed
//! response (or a timeout). A reply that shows up after its command timed
//! out is recognized and dropped instead of answering the next command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{AdapterCommand, ByteTransport, ProtocolError, ResponseFramer};

type ResponseSlot = oneshot::Sender<Result<String, ProtocolError>>;

/// The single outstanding command
///
/// The result slot is consumed by whichever of response, timeout or
/// cancellation gets there first; later attempts find it empty.
#[derive(Debug)]
pub struct PendingCommand {
    id: u64,
    request: AdapterCommand,
    command: String,
    issued_at: Instant,
    timeout: Duration,
    slot: Option<ResponseSlot>,
}

impl PendingCommand {
    fn new(id: u64, request: AdapterCommand, timeout: Duration, slot: ResponseSlot) -> Self {
        Self {
            id,
            command: request.text(),
            request,
            issued_at: Instant::now(),
            timeout,
            slot: Some(slot),
        }
    }

    /// Command text
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Time since the command was accepted
    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_none()
    }

    /// Complete the slot. Returns false if it was already completed.
    fn resolve(&mut self, outcome: Result<String, ProtocolError>) -> bool {
        match self.slot.take() {
            Some(tx) => {
                // The waiter may have gone away; the slot is spent either way
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Cumulative traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub commands: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub stray_responses: u64,
}

struct ChannelInner {
    framer: ResponseFramer,
    pending: Option<PendingCommand>,
    /// Last command that timed out, kept until its reply shows up
    overdue: Option<AdapterCommand>,
    stats: ChannelStats,
}

impl ChannelInner {
    /// A frame that the overdue command claims and the pending one does not
    fn is_late_reply(&self, response: &str) -> bool {
        self.overdue.as_ref().is_some_and(|late| late.claims(response))
            && !self
                .pending
                .as_ref()
                .is_some_and(|pending| pending.request.claims(response))
    }
}

/// Single-flight request/response channel over a [`ByteTransport`]
pub struct CommandChannel {
    transport: Arc<dyn ByteTransport>,
    inner: Mutex<ChannelInner>,
    /// Held for the whole write-then-await span; tokio's mutex is FIFO so
    /// queued submitters transmit in arrival order
    turn: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn ByteTransport>) -> Self {
        Self {
            transport,
            inner: Mutex::new(ChannelInner {
                framer: ResponseFramer::new(),
                pending: None,
                overdue: None,
                stats: ChannelStats::default(),
            }),
            turn: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ChannelInner> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send a command and wait for its response.
    ///
    /// Waits for any earlier command to resolve before transmitting. Fails
    /// immediately with [`ProtocolError::NotConnected`] if the transport has
    /// no link; the command is dropped in that case.
    pub async fn submit(
        &self,
        command: &AdapterCommand,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let _turn = self.turn.lock().await;

        let text = command.text();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.lock_inner();
            // Left behind by a submitter whose future was dropped mid-wait
            if let Some(mut stale) = inner.pending.take() {
                if stale.resolve(Err(ProtocolError::Cancelled)) {
                    warn!(
                        "Cancelled stale pending command '{}' after {}ms",
                        stale.command,
                        stale.elapsed().as_millis()
                    );
                }
            }
            inner.pending = Some(PendingCommand::new(id, command.clone(), timeout, tx));
        }

        let bytes = command.to_bytes();
        if let Err(e) = self.transport.write(&bytes) {
            self.clear_pending(id);
            debug!("Dropped command '{}': {}", text, e);
            return Err(e);
        }

        {
            let mut inner = self.lock_inner();
            inner.stats.tx_bytes = inner.stats.tx_bytes.saturating_add(bytes.len() as u64);
            inner.stats.commands = inner.stats.commands.saturating_add(1);
        }
        debug!("Sent '{}' (timeout {}ms)", text, timeout.as_millis());

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::Cancelled),
            Err(_) => {
                let mut inner = self.lock_inner();
                if inner.pending.as_ref().is_some_and(|p| p.id == id) {
                    inner.pending = None;
                }
                inner.overdue = Some(command.clone());
                inner.stats.timeouts = inner.stats.timeouts.saturating_add(1);
                warn!("No response to '{}' within {}ms", text, timeout.as_millis());
                Err(ProtocolError::Timeout { command: text })
            }
        }
    }

    /// Feed inbound bytes from the transport
    pub fn on_bytes(&self, chunk: &[u8]) {
        let mut inner = self.lock_inner();
        inner.stats.rx_bytes = inner.stats.rx_bytes.saturating_add(chunk.len() as u64);

        for response in inner.framer.push(chunk) {
            if inner.is_late_reply(&response) {
                inner.stats.stray_responses = inner.stats.stray_responses.saturating_add(1);
                if let Some(overdue) = inner.overdue.take() {
                    warn!("Discarding late reply to '{}': {:?}", overdue, response);
                }
                continue;
            }

            match inner.pending.take() {
                Some(mut pending) => {
                    debug!(
                        "Response to '{}' after {}ms: {:?}",
                        pending.command,
                        pending.elapsed().as_millis(),
                        response
                    );
                    pending.resolve(Ok(response));
                    inner.stats.responses = inner.stats.responses.saturating_add(1);
                }
                None => {
                    inner.stats.stray_responses = inner.stats.stray_responses.saturating_add(1);
                    warn!("Discarding response with no pending command: {:?}", response);
                }
            }
        }
    }

    /// Resolve any in-flight command as cancelled and drop buffered bytes.
    ///
    /// Returns true if a waiter was released.
    pub fn cancel_pending(&self) -> bool {
        let mut inner = self.lock_inner();
        inner.framer.clear();
        inner.overdue = None;
        match inner.pending.take() {
            Some(mut pending) => {
                let released = pending.resolve(Err(ProtocolError::Cancelled));
                if released {
                    debug!("Cancelled in-flight command '{}'", pending.command);
                }
                released
            }
            None => false,
        }
    }

    fn clear_pending(&self, id: u64) {
        let mut inner = self.lock_inner();
        if inner.pending.as_ref().is_some_and(|p| p.id == id) {
            inner.pending = None;
        }
    }

    /// Whether a command is awaiting its response
    pub fn has_pending(&self) -> bool {
        self.lock_inner()
            .pending
            .as_ref()
            .is_some_and(|p| !p.is_resolved())
    }

    pub fn stats(&self) -> ChannelStats {
        self.lock_inner().stats
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn ByteTransport> {
        &self.transport
    }
}
