//! Receiver-side transfer state machine. See SPEC_FULL.md §4.5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::framing::Frame;
use crate::mesh_port::NodeId;
use crate::sink::FileSink;

/// Maximum number of NAKs sent in response to a single END. Bounds the
/// worst case (almost nothing received) so a gap-riddled transfer cannot
/// flood the mesh with one NAK per missing chunk.
pub const MAX_NAK_BATCH: usize = 16;

/// Receiver-side lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverState {
    /// Accumulating chunks.
    Receiving,
    /// Reassembled and handed to the sink.
    Completed,
    /// Terminated by an internal condition (idle timeout, sink failure).
    Failed(Error),
    /// Terminated by an explicit abort, ours or the peer's.
    Aborted(String),
}

/// One incoming file transfer.
pub struct ReceiverSession {
    /// Transfer id, assigned by the sender and carried in BEGIN.
    pub transfer_id: String,
    /// Origin node.
    pub peer: NodeId,
    /// Sanitized filename as sent by the sender.
    pub filename: String,
    /// Total chunk count as declared by BEGIN.
    pub total_chunks: u16,
    state: ReceiverState,
    received: HashMap<u16, Vec<u8>>,
    last_activity_at: Instant,
    config: Config,
    events: EventBus,
    sink: Arc<dyn FileSink>,
}

impl ReceiverSession {
    /// Create a session in response to a BEGIN frame.
    ///
    /// Callers are responsible for the one-receiver-session-per-(peer, tid)
    /// precondition; this constructor does not check it. No frames are sent
    /// here: the receiver waits silently for the first DATA.
    pub fn on_begin(
        peer: NodeId,
        tid: String,
        total: u16,
        filename: String,
        config: Config,
        events: EventBus,
        sink: Arc<dyn FileSink>,
        now: Instant,
    ) -> Self {
        tracing::info!(%tid, %peer, total, "transfer begin");
        Self {
            transfer_id: tid,
            peer,
            filename,
            total_chunks: total,
            state: ReceiverState::Receiving,
            received: HashMap::new(),
            last_activity_at: now,
            config,
            events,
            sink,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &ReceiverState {
        &self.state
    }

    /// Whether this session has reached a terminal state and may be reaped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ReceiverState::Completed | ReceiverState::Failed(_) | ReceiverState::Aborted(_)
        )
    }

    /// Handle a frame addressed to this session's transfer id.
    pub async fn on_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }
        match frame {
            Frame::Data { idx, payload, .. } => self.on_data(*idx, payload.clone(), now),
            Frame::End { .. } => self.on_end().await,
            Frame::Abt { reason, .. } => self.on_abt(reason.clone()),
            other => {
                tracing::debug!(tid = %self.transfer_id, ?other, "frame not meaningful to receiver session");
                Vec::new()
            }
        }
    }

    fn on_data(&mut self, idx: u16, payload: Vec<u8>, now: Instant) -> Vec<Frame> {
        self.last_activity_at = now;

        if idx >= self.total_chunks || payload.len() > self.config.chunk_payload_max {
            let err = Error::ProtocolError(format!(
                "chunk {idx} invalid for transfer of {} chunks",
                self.total_chunks
            ));
            self.state = ReceiverState::Aborted(err.to_string());
            self.events.publish(Event::TransferFailed {
                tid: self.transfer_id.clone(),
                reason: err.to_string(),
            });
            return vec![Frame::Abt { tid: self.transfer_id.clone(), reason: err.to_string() }];
        }

        if !self.received.contains_key(&idx) {
            self.received.insert(idx, payload);
            self.events.publish(Event::TransferProgress {
                tid: self.transfer_id.clone(),
                done: self.received.len() as u16,
                total: self.total_chunks,
            });
        }

        vec![Frame::Ack { tid: self.transfer_id.clone(), idx }]
    }

    async fn on_end(&mut self) -> Vec<Frame> {
        if self.received.len() as u16 == self.total_chunks {
            let mut bytes = Vec::new();
            for idx in 0..self.total_chunks {
                bytes.extend_from_slice(&self.received[&idx]);
            }

            match self.sink.deliver(&self.filename, &bytes).await {
                Ok(()) => {
                    self.state = ReceiverState::Completed;
                    tracing::info!(tid = %self.transfer_id, "transfer completed");
                    self.events.publish(Event::TransferCompleted { tid: self.transfer_id.clone() });
                    vec![Frame::Fin { tid: self.transfer_id.clone(), ok: true }]
                }
                Err(err) => {
                    tracing::warn!(tid = %self.transfer_id, error = %err, "sink rejected delivery");
                    self.events.publish(Event::TransferFailed {
                        tid: self.transfer_id.clone(),
                        reason: err.to_string(),
                    });
                    self.state = ReceiverState::Failed(err);
                    vec![Frame::Fin { tid: self.transfer_id.clone(), ok: false }]
                }
            }
        } else {
            (0..self.total_chunks)
                .filter(|idx| !self.received.contains_key(idx))
                .take(MAX_NAK_BATCH)
                .map(|idx| Frame::Nak { tid: self.transfer_id.clone(), idx })
                .collect()
        }
    }

    fn on_abt(&mut self, reason: String) -> Vec<Frame> {
        tracing::warn!(tid = %self.transfer_id, %reason, "peer aborted transfer");
        self.state = ReceiverState::Aborted(reason.clone());
        self.events.publish(Event::TransferFailed { tid: self.transfer_id.clone(), reason });
        Vec::new()
    }

    /// Force this session into `Failed(err)`, e.g. when a frame belonging to
    /// it could not be encoded. A no-op if the session is already terminal.
    pub(crate) fn fail(&mut self, err: Error) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }
        tracing::warn!(tid = %self.transfer_id, error = %err, "receiver session failed");
        self.state = ReceiverState::Failed(err.clone());
        self.events.publish(Event::TransferFailed {
            tid: self.transfer_id.clone(),
            reason: err.to_string(),
        });
        vec![Frame::Abt { tid: self.transfer_id.clone(), reason: err.to_string() }]
    }

    /// Check the idle watchdog for the current tick.
    pub fn tick(&mut self, now: Instant) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }
        if now.saturating_duration_since(self.last_activity_at) > self.config.recv_idle_timeout {
            let err = Error::IdleTimeout;
            self.state = ReceiverState::Failed(err.clone());
            self.events.publish(Event::TransferFailed {
                tid: self.transfer_id.clone(),
                reason: err.to_string(),
            });
            return vec![Frame::Abt { tid: self.transfer_id.clone(), reason: err.to_string() }];
        }
        Vec::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
