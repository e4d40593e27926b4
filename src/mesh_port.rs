//! # Mesh Port
//!
//! The sole adapter between the protocol engine and the concrete mesh
//! device. Everything above this module treats the mesh as an idealized
//! datagram channel with loss and reordering but no duplication guarantees
//! of its own. See SPEC_FULL.md §4.2.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Opaque stable identifier of a mesh peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an owned or borrowed id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Send destination: a specific node, or a mesh-wide broadcast.
///
/// Only PING uses `Broadcast`; transfers are always unicast to a single
/// peer (SPEC_FULL.md Non-goals excludes broadcast transfers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A specific node.
    Node(NodeId),
    /// Every node within range.
    Broadcast,
}

/// Link-quality metadata the device reports alongside a received frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkMetrics {
    /// Signal-to-noise ratio, in dB. Display/peer-quality hint only.
    pub snr: f32,
    /// Received signal strength indicator, in dBm.
    pub rssi: i32,
    /// Number of mesh hops the frame traveled.
    pub hop_count: u8,
}

/// A frame received from the mesh, with its origin and link quality.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// The node that sent this frame.
    pub origin: NodeId,
    /// The raw wire-form frame text.
    pub bytes: String,
    /// Link metrics reported by the device for this frame.
    pub link: LinkMetrics,
}

/// The abstract duplex channel to the mesh device.
///
/// Implementations are the only code in the crate that depends on a
/// concrete device's shape; the rest of the engine is testable purely
/// against [`FakeMeshPort`].
#[async_trait]
pub trait MeshPort: Send {
    /// Send a frame to `dest`. Returns `Error::DeviceTransient` for
    /// recoverable conditions (device busy, radio not ready) and
    /// `Error::DeviceFatal` for unrecoverable ones (device disconnected).
    async fn send(&self, dest: Destination, frame_bytes: String) -> Result<()>;

    /// Await the next inbound frame. This is a lazy, infinite,
    /// non-restartable stream: once it returns `Error::DeviceFatal`, the
    /// port is considered closed and must not be polled again.
    async fn recv(&mut self) -> Result<InboundFrame>;

    /// The local node's own id.
    fn local_id(&self) -> NodeId;
}

/// An in-memory [`MeshPort`] for tests: two instances created by
/// [`fake_port_pair`] are wired together so that frames sent by one arrive
/// as inbound frames on the other, modeling loss deterministically via an
/// injectable drop predicate rather than real randomness or real time.
pub struct FakeMeshPort {
    local_id: NodeId,
    outbound_to_peer: mpsc::UnboundedSender<InboundFrame>,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
    drop_rule: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    sent_log: Arc<Mutex<Vec<String>>>,
    link: LinkMetrics,
}

impl FakeMeshPort {
    /// Replace the drop predicate. Frames for which the predicate returns
    /// `true` are recorded as sent but never delivered to the peer,
    /// modeling a lost frame.
    pub fn set_drop_rule(&mut self, rule: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.drop_rule = Arc::new(rule);
    }

    /// Set the link metrics this port reports on delivered frames.
    pub fn set_link_metrics(&mut self, link: LinkMetrics) {
        self.link = link;
    }

    /// Every frame this port has been asked to send, in order, including
    /// ones dropped by the drop rule.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent_log.lock().clone()
    }
}

#[async_trait]
impl MeshPort for FakeMeshPort {
    async fn send(&self, _dest: Destination, frame_bytes: String) -> Result<()> {
        self.sent_log.lock().push(frame_bytes.clone());

        if (self.drop_rule)(&frame_bytes) {
            return Ok(());
        }

        let inbound = InboundFrame {
            origin: self.local_id.clone(),
            bytes: frame_bytes,
            link: self.link,
        };
        // The peer may have already been dropped in a one-sided test; a
        // closed channel just means nobody is listening, not a device error.
        let _ = self.outbound_to_peer.send(inbound);
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundFrame> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| Error::DeviceFatal("fake mesh port closed".into()))
    }

    fn local_id(&self) -> NodeId {
        self.local_id.clone()
    }
}

/// Create two [`FakeMeshPort`]s wired to each other, as if `a_id` and
/// `b_id` were in range of one another.
pub fn fake_port_pair(a_id: impl Into<NodeId>, b_id: impl Into<NodeId>) -> (FakeMeshPort, FakeMeshPort) {
    let (tx_ab, rx_ba) = mpsc::unbounded_channel();
    let (tx_ba, rx_ab) = mpsc::unbounded_channel();

    let a_id = a_id.into();
    let b_id = b_id.into();

    let port_a = FakeMeshPort {
        local_id: a_id,
        outbound_to_peer: tx_ab,
        inbound: rx_ab,
        drop_rule: Arc::new(|_| false),
        sent_log: Arc::new(Mutex::new(Vec::new())),
        link: LinkMetrics::default(),
    };
    let port_b = FakeMeshPort {
        local_id: b_id,
        outbound_to_peer: tx_ba,
        inbound: rx_ba,
        drop_rule: Arc::new(|_| false),
        sent_log: Arc::new(Mutex::new(Vec::new())),
        link: LinkMetrics::default(),
    };

    (port_a, port_b)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new("!a1b2c3d4");
        assert_eq!(id.to_string(), "!a1b2c3d4");
        assert_eq!(id.as_str(), "!a1b2c3d4");
    }

    #[tokio::test]
    async fn test_fake_port_pair_delivers_frames() {
        let (port_a, mut port_b) = fake_port_pair("a", "b");

        port_a
            .send(Destination::Node(NodeId::new("b")), "P|nonce1".into())
            .await
            .unwrap();

        let received = port_b.recv().await.unwrap();
        assert_eq!(received.bytes, "P|nonce1");
        assert_eq!(received.origin, NodeId::new("a"));
    }

    #[tokio::test]
    async fn test_fake_port_drop_rule_loses_frame() {
        let (mut port_a, mut port_b) = fake_port_pair("a", "b");
        port_a.set_drop_rule(|frame| frame.starts_with("D|tx1|2|"));

        port_a
            .send(Destination::Node(NodeId::new("b")), "D|tx1|2|AAA".into())
            .await
            .unwrap();
        port_a
            .send(Destination::Node(NodeId::new("b")), "D|tx1|3|BBB".into())
            .await
            .unwrap();

        let received = port_b.recv().await.unwrap();
        assert_eq!(received.bytes, "D|tx1|3|BBB");
        assert_eq!(port_a.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn test_fake_port_closed_is_fatal() {
        let (port_a, mut port_b) = fake_port_pair("a", "b");
        drop(port_a);
        let result = port_b.recv().await;
        assert!(matches!(result, Err(Error::DeviceFatal(_))));
    }

    #[test]
    fn test_local_id_accessor() {
        let (port_a, port_b) = fake_port_pair("a", "b");
        assert_eq!(port_a.local_id(), NodeId::new("a"));
        assert_eq!(port_b.local_id(), NodeId::new("b"));
    }
}
