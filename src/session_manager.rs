//! # Session Manager
//!
//! The single owner of every live transfer session. Routes inbound frames,
//! enforces one sender and one receiver session per peer, drives the tick
//! clock, and rate-limits outbound sends. See SPEC_FULL.md §4.6 and §5.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::framing::{Frame, DEFAULT_FRAME_BUDGET};
use crate::mesh_port::{Destination, InboundFrame, MeshPort, NodeId};
use crate::node::NodeRegistry;
use crate::sink::FileSink;
use crate::transfer::{generate_transfer_id, ReceiverSession, SenderSession};

/// A fixed-capacity, steadily-refilling token bucket gating DATA emission,
/// approximating the mesh's regulatory duty-cycle limit.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_hz: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, rate_hz: u32, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            rate_hz: rate_hz as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_hz).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Owns every active transfer, the node registry, and the outbound rate
/// limiter for a single mesh port.
///
/// Boxed rather than generic: the manager is meant to be the one long-lived
/// instance wired to a concrete device adapter (or a [`crate::mesh_port::FakeMeshPort`]
/// in tests), not monomorphized per adapter type.
pub struct SessionManager {
    port: Box<dyn MeshPort>,
    config: Config,
    events: EventBus,
    registry: NodeRegistry,
    sink: Arc<dyn FileSink>,
    local_name: String,
    senders: HashMap<NodeId, SenderSession>,
    receivers: HashMap<(NodeId, String), ReceiverSession>,
    outbound: VecDeque<(Destination, Frame)>,
    bucket: TokenBucket,
    last_discovery: Instant,
}

impl SessionManager {
    /// Create a manager over `port`, with `local_name` advertised in PONG
    /// replies and completed transfers persisted via `sink`.
    pub fn new(port: Box<dyn MeshPort>, config: Config, sink: Arc<dyn FileSink>, local_name: impl Into<String>) -> Self {
        let now = Instant::now();
        let events = EventBus::new();
        let registry = NodeRegistry::new(events.clone());
        Self {
            events,
            registry,
            bucket: TokenBucket::new(config.tx_burst, config.tx_rate_hz, now),
            last_discovery: now,
            port,
            sink,
            local_name: local_name.into(),
            senders: HashMap::new(),
            receivers: HashMap::new(),
            outbound: VecDeque::new(),
            config,
        }
    }

    /// Subscribe to protocol events.
    pub fn subscribe(&self) -> crate::events::Subscription {
        self.events.subscribe()
    }

    /// Read-only view of the node registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Number of sender sessions currently live.
    pub fn active_sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Number of receiver sessions currently live.
    pub fn active_receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Start sending `bytes` as `filename` to `peer`. Fails with
    /// `Error::PeerBusy` if a sender session to this peer is already active.
    pub fn start_transfer(&mut self, peer: NodeId, filename: &str, bytes: &[u8], now: Instant) -> Result<String> {
        if self.senders.contains_key(&peer) {
            return Err(Error::PeerBusy);
        }
        let (session, frames) =
            SenderSession::start(peer.clone(), filename, bytes, self.config.clone(), self.events.clone(), now);
        let tid = session.transfer_id.clone();
        self.senders.insert(peer.clone(), session);
        self.enqueue(Destination::Node(peer), frames);
        Ok(tid)
    }

    /// Explicitly abort the sender session to `peer`, if one is active.
    pub fn abort_transfer(&mut self, peer: &NodeId, reason: impl Into<String>) {
        if let Some(session) = self.senders.get_mut(peer) {
            let frames = session.abort(reason);
            self.enqueue(Destination::Node(peer.clone()), frames);
        }
    }

    /// Handle one inbound frame from the mesh port.
    pub async fn on_inbound(&mut self, inbound: InboundFrame, now: Instant) -> Result<()> {
        let frame = match Frame::decode(&inbound.bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(origin = %inbound.origin, error = %err, "dropping malformed frame");
                return Ok(());
            }
        };

        match &frame {
            Frame::Pong { name, .. } => {
                self.registry.observe_pong(inbound.origin.clone(), name.clone(), inbound.link, now);
            }
            _ => {
                self.registry.observe(inbound.origin.clone(), inbound.link, now);
            }
        }

        let origin = inbound.origin;
        let out_frames = self.route_frame(&origin, &frame, now).await;
        self.enqueue(Destination::Node(origin), out_frames);
        self.reap_terminal_sessions();
        Ok(())
    }

    async fn route_frame(&mut self, origin: &NodeId, frame: &Frame, now: Instant) -> Vec<Frame> {
        match frame {
            Frame::Ping { nonce } => {
                vec![Frame::Pong { nonce: nonce.clone(), name: self.local_name.clone() }]
            }
            Frame::Pong { .. } => Vec::new(),
            Frame::Begin { tid, total, filename } => {
                let key = (origin.clone(), tid.clone());
                if self.receivers.keys().any(|(o, _)| o == origin) {
                    tracing::debug!(%tid, %origin, "peer already has an active receiver session, begin ignored");
                    return Vec::new();
                }
                let session = ReceiverSession::on_begin(
                    origin.clone(),
                    tid.clone(),
                    *total,
                    filename.clone(),
                    self.config.clone(),
                    self.events.clone(),
                    self.sink.clone(),
                    now,
                );
                self.receivers.insert(key, session);
                Vec::new()
            }
            Frame::Data { tid, .. } | Frame::End { tid } => {
                let key = (origin.clone(), tid.clone());
                match self.receivers.get_mut(&key) {
                    Some(session) => session.on_frame(frame, now).await,
                    None => {
                        tracing::debug!(%tid, "frame for unknown receiver session, ignored");
                        Vec::new()
                    }
                }
            }
            Frame::Ack { tid, .. } | Frame::Nak { tid, .. } | Frame::Fin { tid, .. } => {
                match self.senders.get_mut(origin) {
                    Some(session) if &session.transfer_id == tid => session.on_frame(frame, now),
                    _ => {
                        tracing::debug!(%tid, "frame for unknown sender session, ignored");
                        Vec::new()
                    }
                }
            }
            Frame::Abt { tid, .. } => {
                let key = (origin.clone(), tid.clone());
                if let Some(session) = self.receivers.get_mut(&key) {
                    return session.on_frame(frame, now).await;
                }
                if let Some(session) = self.senders.get_mut(origin) {
                    if &session.transfer_id == tid {
                        return session.on_frame(frame, now);
                    }
                }
                Vec::new()
            }
        }
    }

    /// Advance watchdogs, discovery, and the outbound rate limiter by one
    /// tick. Callers drive this at a fixed frequency (default 1 Hz).
    pub async fn tick(&mut self, now: Instant) -> Result<()> {
        let peers: Vec<NodeId> = self.senders.keys().cloned().collect();
        for peer in peers {
            if let Some(session) = self.senders.get_mut(&peer) {
                let frames = session.tick(now);
                self.enqueue(Destination::Node(peer), frames);
            }
        }

        let keys: Vec<(NodeId, String)> = self.receivers.keys().cloned().collect();
        for key in keys {
            if let Some(session) = self.receivers.get_mut(&key) {
                let frames = session.tick(now);
                self.enqueue(Destination::Node(key.0.clone()), frames);
            }
        }

        if now.saturating_duration_since(self.last_discovery) >= self.config.discovery_interval {
            self.last_discovery = now;
            let nonce = generate_transfer_id();
            self.enqueue(Destination::Broadcast, vec![Frame::Ping { nonce }]);
        }

        self.reap_terminal_sessions();
        self.drain_outbound(now).await
    }

    fn enqueue(&mut self, dest: Destination, frames: Vec<Frame>) {
        for frame in frames {
            self.outbound.push_back((dest.clone(), frame));
        }
    }

    /// Flush as much of the outbound queue as the rate limiter currently
    /// allows. Non-DATA frames are never throttled; a DATA frame blocked on
    /// the bucket stays at the front of the queue for the next drain.
    async fn drain_outbound(&mut self, now: Instant) -> Result<()> {
        while let Some((dest, frame)) = self.outbound.front() {
            if matches!(frame, Frame::Data { .. }) && !self.bucket.try_take(now) {
                break;
            }
            let (dest, frame) = self.outbound.pop_front().expect("checked by front() above");
            let wire = match frame.encode(DEFAULT_FRAME_BUDGET) {
                Ok(wire) => wire,
                Err(err) => {
                    tracing::error!(error = %err, "frame failed to encode, failing its session");
                    let tid = frame.tid().map(str::to_string);
                    self.fail_session_for(&dest, tid.as_deref(), err);
                    continue;
                }
            };
            if let Err(err) = self.port.send(dest, wire).await {
                tracing::warn!(error = %err, "mesh port send failed");
                if matches!(err, Error::DeviceFatal(_)) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// A frame destined for `dest` and scoped to `tid` could not be encoded.
    /// This is a programming error per SPEC_FULL.md §7 (e.g. an unsanitized
    /// pipe character reaching the wire), not a transient one: fail the
    /// owning session outright rather than retrying it forever.
    fn fail_session_for(&mut self, dest: &Destination, tid: Option<&str>, err: Error) {
        let (Destination::Node(peer), Some(tid)) = (dest, tid) else {
            return;
        };

        if let Some(session) = self.senders.get_mut(peer) {
            if session.transfer_id == tid {
                let frames = session.fail(err);
                self.enqueue(dest.clone(), frames);
                return;
            }
        }

        let key = (peer.clone(), tid.to_string());
        if let Some(session) = self.receivers.get_mut(&key) {
            let frames = session.fail(err);
            self.enqueue(dest.clone(), frames);
        }
    }

    fn reap_terminal_sessions(&mut self) {
        self.senders.retain(|_, session| !session.is_terminal());
        self.receivers.retain(|_, session| !session.is_terminal());
    }

    /// Abort every live session with `reason`, flush abort frames
    /// best-effort, and stop driving this manager.
    pub async fn shutdown(&mut self, reason: &str) {
        let peers: Vec<NodeId> = self.senders.keys().cloned().collect();
        for peer in peers {
            self.abort_transfer(&peer, reason.to_string());
        }
        let now = Instant::now();
        let _ = self.drain_outbound(now).await;
        let at = crate::time::now_timestamp_millis();
        self.events.publish(Event::LogLine { level: "info", text: format!("[{at}] shutdown: {reason}") });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh_port::fake_port_pair;
    use crate::sink::MemorySink;

    fn manager(port: crate::mesh_port::FakeMeshPort, name: &str) -> SessionManager {
        SessionManager::new(Box::new(port), Config::default(), Arc::new(MemorySink::new()), name)
    }

    #[tokio::test]
    async fn test_end_to_end_small_file_transfer() {
        let (port_a, port_b) = fake_port_pair("a", "b");
        let mut sender_mgr = manager(port_a, "node-a");
        let mut receiver_mgr = manager(port_b, "node-b");

        let now = Instant::now();
        sender_mgr
            .start_transfer(NodeId::new("b"), "hello.txt", b"hello mesh", now)
            .unwrap();
        sender_mgr.tick(now).await.unwrap();

        // Pump frames back and forth until both sides go quiet.
        for _ in 0..20 {
            let mut progressed = false;
            while let Ok(inbound) = timeout_recv(&mut receiver_mgr).await {
                receiver_mgr.on_inbound(inbound, now).await.unwrap();
                receiver_mgr.tick(now).await.unwrap();
                progressed = true;
            }
            while let Ok(inbound) = timeout_recv(&mut sender_mgr).await {
                sender_mgr.on_inbound(inbound, now).await.unwrap();
                sender_mgr.tick(now).await.unwrap();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        assert_eq!(sender_mgr.active_sender_count(), 0);
    }

    #[tokio::test]
    async fn test_start_transfer_rejects_second_session_to_same_peer() {
        let (port_a, _port_b) = fake_port_pair("a", "b");
        let mut mgr = manager(port_a, "node-a");
        let now = Instant::now();

        mgr.start_transfer(NodeId::new("b"), "f1.txt", b"one", now).unwrap();
        let result = mgr.start_transfer(NodeId::new("b"), "f2.txt", b"two", now);
        assert!(matches!(result, Err(Error::PeerBusy)));
    }

    #[tokio::test]
    async fn test_begin_rejects_second_session_from_same_peer() {
        let (port_a, _port_b) = fake_port_pair("a", "b");
        let mut mgr = manager(port_a, "node-a");
        let now = Instant::now();

        let begin1 = Frame::Begin { tid: "tx0001".into(), total: 2, filename: "f1.txt".into() };
        let begin2 = Frame::Begin { tid: "tx0002".into(), total: 2, filename: "f2.txt".into() };

        mgr.on_inbound(InboundFrame { origin: NodeId::new("b"), bytes: begin1.encode(DEFAULT_FRAME_BUDGET).unwrap(), link: Default::default() }, now)
            .await
            .unwrap();
        mgr.on_inbound(InboundFrame { origin: NodeId::new("b"), bytes: begin2.encode(DEFAULT_FRAME_BUDGET).unwrap(), link: Default::default() }, now)
            .await
            .unwrap();

        assert_eq!(mgr.active_receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_ping_gets_pong_reply() {
        let (port_a, port_b) = fake_port_pair("a", "b");
        let mut mgr_a = manager(port_a, "node-a");
        let mut mgr_b = manager(port_b, "node-b");
        let now = Instant::now();

        mgr_a.enqueue(Destination::Broadcast, vec![Frame::Ping { nonce: "n1".into() }]);
        mgr_a.drain_outbound(now).await.unwrap();

        let inbound = timeout_recv(&mut mgr_b).await.unwrap();
        mgr_b.on_inbound(inbound, now).await.unwrap();
        mgr_b.tick(now).await.unwrap();

        let reply = timeout_recv(&mut mgr_a).await.unwrap();
        let frame = Frame::decode(&reply.bytes).unwrap();
        assert!(matches!(frame, Frame::Pong { name, .. } if name == "node-b"));
    }

    // `FakeMeshPort::recv` waits forever on an empty channel; tests pump a
    // bounded number of times instead of driving a real event loop, so poll
    // with a short timeout rather than calling `recv` directly.
    async fn timeout_recv(mgr: &mut SessionManager) -> std::result::Result<InboundFrame, ()> {
        match tokio::time::timeout(Duration::from_millis(20), mgr.port.recv()).await {
            Ok(Ok(frame)) => Ok(frame),
            _ => Err(()),
        }
    }
}
