//! Sender-side transfer state machine. See SPEC_FULL.md §4.4.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::config::Config;
use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::framing::{sanitize_filename, split_chunks, Frame};
use crate::mesh_port::NodeId;

use super::FILENAME_MAX_LEN;

/// Sender-side lifecycle state. `Failed` and `Aborted` are terminal and
/// carry the reason; a session never leaves them.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderState {
    /// BEGIN (and the first chunk) have been sent; awaiting first contact.
    Negotiating,
    /// Stop-and-wait chunk delivery in progress.
    Transferring,
    /// All chunks acked, END sent, awaiting FIN.
    Finalizing,
    /// FIN(ok) received.
    Completed,
    /// Terminated by an internal condition (no response, exhausted retries, peer FIN(err)).
    Failed(Error),
    /// Terminated by an explicit abort, ours or the peer's.
    Aborted(String),
}

/// One outgoing file transfer.
pub struct SenderSession {
    /// Transfer id assigned at `start`.
    pub transfer_id: String,
    /// Destination node.
    pub peer: NodeId,
    /// Sanitized filename carried in BEGIN.
    pub filename: String,
    /// Total chunk count, fixed at creation.
    pub total_chunks: u16,
    state: SenderState,
    chunks: Vec<Vec<u8>>,
    unacked: BTreeSet<u16>,
    retry_count: HashMap<u16, u8>,
    next_to_send: u16,
    acked_count: u16,
    begin_retry_count: u8,
    final_retry_count: u8,
    watchdog_deadline: Option<Instant>,
    config: Config,
    events: EventBus,
}

impl SenderSession {
    /// Begin a new transfer to `peer`. Sends BEGIN and the first chunk.
    ///
    /// Callers are responsible for the one-sender-session-per-peer
    /// precondition; this constructor does not check it.
    pub fn start(
        peer: NodeId,
        filename: &str,
        file_bytes: &[u8],
        config: Config,
        events: EventBus,
        now: Instant,
    ) -> (Self, Vec<Frame>) {
        let transfer_id = super::generate_transfer_id();
        let sanitized_filename = sanitize_filename(filename, FILENAME_MAX_LEN);
        let chunks = split_chunks(file_bytes, config.chunk_payload_max);
        let total_chunks = chunks.len() as u16;

        let mut unacked = BTreeSet::new();
        unacked.insert(0u16);
        let mut retry_count = HashMap::new();
        retry_count.insert(0u16, 0u8);

        let mut session = Self {
            transfer_id: transfer_id.clone(),
            peer: peer.clone(),
            filename: sanitized_filename.clone(),
            total_chunks,
            state: SenderState::Negotiating,
            chunks,
            unacked,
            retry_count,
            next_to_send: 1,
            acked_count: 0,
            begin_retry_count: 0,
            final_retry_count: 0,
            watchdog_deadline: Some(now + config.negotiate_timeout),
            config,
            events,
        };

        session.events.publish(Event::TransferStarted {
            tid: transfer_id.clone(),
            peer,
            total_chunks,
        });
        session.events.publish(Event::ChunkSent { tid: transfer_id.clone(), idx: 0 });

        tracing::info!(tid = %transfer_id, peer = %session.peer, total_chunks, "transfer started");

        let frames = vec![
            Frame::Begin {
                tid: transfer_id.clone(),
                total: total_chunks,
                filename: session.filename.clone(),
            },
            Frame::Data {
                tid: transfer_id,
                idx: 0,
                payload: session.chunks[0].clone(),
            },
        ];

        (session, frames)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &SenderState {
        &self.state
    }

    /// Whether this session has reached a terminal state and may be reaped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SenderState::Completed | SenderState::Failed(_) | SenderState::Aborted(_)
        )
    }

    /// Handle a frame addressed to this session's transfer id.
    pub fn on_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }
        match frame {
            Frame::Ack { idx, .. } => self.on_ack(*idx, now),
            Frame::Nak { idx, .. } => self.on_nak(*idx, now),
            Frame::Fin { ok, .. } => self.on_fin(*ok),
            Frame::Abt { reason, .. } => self.on_abt(reason.clone()),
            other => {
                tracing::debug!(tid = %self.transfer_id, ?other, "frame not meaningful to sender session");
                Vec::new()
            }
        }
    }

    fn on_ack(&mut self, idx: u16, now: Instant) -> Vec<Frame> {
        if idx >= self.total_chunks {
            tracing::warn!(tid = %self.transfer_id, idx, "ack for unknown chunk index, ignored");
            return Vec::new();
        }

        if matches!(self.state, SenderState::Negotiating) {
            self.state = SenderState::Transferring;
        }

        if !self.unacked.remove(&idx) {
            // Duplicate ack, or an ack for a chunk we already retired. Idempotent no-op.
            return Vec::new();
        }

        self.retry_count.remove(&idx);
        self.acked_count += 1;
        self.events.publish(Event::ChunkAcked { tid: self.transfer_id.clone(), idx });
        self.events.publish(Event::TransferProgress {
            tid: self.transfer_id.clone(),
            done: self.acked_count,
            total: self.total_chunks,
        });

        if !self.unacked.is_empty() {
            return Vec::new();
        }

        if self.next_to_send >= self.total_chunks {
            self.state = SenderState::Finalizing;
            self.final_retry_count = 0;
            self.watchdog_deadline = Some(now + self.config.final_timeout);
            tracing::info!(tid = %self.transfer_id, "all chunks acked, sending END");
            return vec![Frame::End { tid: self.transfer_id.clone() }];
        }

        let next_idx = self.next_to_send;
        self.next_to_send += 1;
        self.unacked.insert(next_idx);
        self.retry_count.insert(next_idx, 0);
        self.watchdog_deadline = Some(now + self.config.chunk_timeout);
        self.events.publish(Event::ChunkSent { tid: self.transfer_id.clone(), idx: next_idx });

        vec![Frame::Data {
            tid: self.transfer_id.clone(),
            idx: next_idx,
            payload: self.chunks[next_idx as usize].clone(),
        }]
    }

    fn on_nak(&mut self, idx: u16, now: Instant) -> Vec<Frame> {
        if !self.unacked.contains(&idx) {
            tracing::debug!(tid = %self.transfer_id, idx, "nak for chunk not outstanding, ignored");
            return Vec::new();
        }

        let count = self.retry_count.entry(idx).or_insert(0);
        *count += 1;
        if *count > self.config.max_retries {
            return self.fail(Error::ChunkExhausted(idx));
        }

        self.watchdog_deadline = Some(now + self.config.chunk_timeout);
        self.events.publish(Event::ChunkSent { tid: self.transfer_id.clone(), idx });

        vec![Frame::Data {
            tid: self.transfer_id.clone(),
            idx,
            payload: self.chunks[idx as usize].clone(),
        }]
    }

    fn on_fin(&mut self, ok: bool) -> Vec<Frame> {
        if !matches!(self.state, SenderState::Finalizing) {
            tracing::debug!(tid = %self.transfer_id, "fin received outside finalizing, ignored");
            return Vec::new();
        }
        if ok {
            self.state = SenderState::Completed;
            tracing::info!(tid = %self.transfer_id, "transfer completed");
            self.events.publish(Event::TransferCompleted { tid: self.transfer_id.clone() });
        } else {
            let err = Error::ProtocolError("peer reported fin(err)".into());
            self.state = SenderState::Failed(err.clone());
            self.events.publish(Event::TransferFailed {
                tid: self.transfer_id.clone(),
                reason: err.to_string(),
            });
        }
        Vec::new()
    }

    fn on_abt(&mut self, reason: String) -> Vec<Frame> {
        tracing::warn!(tid = %self.transfer_id, %reason, "peer aborted transfer");
        self.state = SenderState::Aborted(reason.clone());
        self.events.publish(Event::TransferFailed { tid: self.transfer_id.clone(), reason });
        Vec::new()
    }

    /// Drive watchdogs and retransmission for the current tick.
    pub fn tick(&mut self, now: Instant) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }

        let deadline = match self.watchdog_deadline {
            Some(d) => d,
            None => return Vec::new(),
        };
        if now < deadline {
            return Vec::new();
        }

        match self.state {
            SenderState::Negotiating => {
                self.begin_retry_count += 1;
                if self.begin_retry_count > self.config.max_retries {
                    return self.fail(Error::NoResponse);
                }
                self.watchdog_deadline = Some(now + self.config.negotiate_timeout);
                tracing::debug!(tid = %self.transfer_id, attempt = self.begin_retry_count, "retransmitting begin");
                vec![
                    Frame::Begin {
                        tid: self.transfer_id.clone(),
                        total: self.total_chunks,
                        filename: self.filename.clone(),
                    },
                    Frame::Data {
                        tid: self.transfer_id.clone(),
                        idx: 0,
                        payload: self.chunks[0].clone(),
                    },
                ]
            }
            SenderState::Transferring => {
                // BTreeSet keeps the lowest index first, satisfying the tie-break rule.
                let idx = match self.unacked.iter().next().copied() {
                    Some(idx) => idx,
                    None => return Vec::new(),
                };
                let count = self.retry_count.entry(idx).or_insert(0);
                *count += 1;
                if *count > self.config.max_retries {
                    return self.fail(Error::ChunkExhausted(idx));
                }
                self.watchdog_deadline = Some(now + self.config.chunk_timeout);
                self.events.publish(Event::ChunkTimedOut { tid: self.transfer_id.clone(), idx });
                self.events.publish(Event::ChunkSent { tid: self.transfer_id.clone(), idx });
                vec![Frame::Data {
                    tid: self.transfer_id.clone(),
                    idx,
                    payload: self.chunks[idx as usize].clone(),
                }]
            }
            SenderState::Finalizing => {
                if self.final_retry_count == 0 {
                    self.final_retry_count = 1;
                    self.watchdog_deadline = Some(now + self.config.final_timeout);
                    vec![Frame::End { tid: self.transfer_id.clone() }]
                } else {
                    self.fail(Error::NoResponse)
                }
            }
            SenderState::Completed | SenderState::Failed(_) | SenderState::Aborted(_) => Vec::new(),
        }
    }

    /// Explicitly abort this transfer, sending ABT to the peer.
    pub fn abort(&mut self, reason: impl Into<String>) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }
        let reason = reason.into();
        self.state = SenderState::Aborted(reason.clone());
        self.events.publish(Event::TransferFailed {
            tid: self.transfer_id.clone(),
            reason: reason.clone(),
        });
        vec![Frame::Abt { tid: self.transfer_id.clone(), reason }]
    }

    /// Force this session into `Failed(err)`, e.g. when a frame belonging to
    /// it could not be encoded. A no-op if the session is already terminal.
    pub(crate) fn fail(&mut self, err: Error) -> Vec<Frame> {
        if self.is_terminal() {
            return Vec::new();
        }
        tracing::warn!(tid = %self.transfer_id, error = %err, "sender session failed");
        self.events.publish(Event::TransferFailed {
            tid: self.transfer_id.clone(),
            reason: err.to_string(),
        });
        self.state = SenderState::Failed(err);
        Vec::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
