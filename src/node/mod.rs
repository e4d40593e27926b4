//! # Node Registry
//!
//! Tracks observed mesh peers: id, last-heard timestamp, last SNR/RSSI,
//! and short display name. Populated by passively observing any inbound
//! frame and by periodic discovery pings. See SPEC_FULL.md §4.3.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::events::{Event, EventBus};
use crate::mesh_port::{LinkMetrics, NodeId};

/// SNR delta, in dB, that is considered a significant enough change to
/// re-emit `NodeSeen` for an already-known node.
pub const DEFAULT_SNR_CHANGE_THRESHOLD: f32 = 6.0;

/// A tracked mesh peer.
///
/// Created on first observation of any frame from that id; updated on
/// every subsequent frame; never deleted during a process lifetime (stale
/// entries are flagged by [`NodeRecord::is_active`], not removed).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    /// The node's id.
    pub id: NodeId,
    /// Display name, learned from a PONG's `name` field.
    pub display_name: Option<String>,
    /// Time of the most recent observation of this node, by the engine's
    /// tick clock.
    pub last_heard_at: Instant,
    /// Most recently reported SNR, in dB.
    pub last_snr: f32,
    /// Most recently reported RSSI, in dBm.
    pub last_rssi: i32,
}

impl NodeRecord {
    fn new(id: NodeId, link: LinkMetrics, now: Instant) -> Self {
        Self {
            id,
            display_name: None,
            last_heard_at: now,
            last_snr: link.snr,
            last_rssi: link.rssi,
        }
    }

    /// A node is active if it has been heard from within `window` of `now`.
    /// Inactive nodes stay in the registry but are flagged, never deleted.
    pub fn is_active(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_heard_at) <= window
    }
}

/// Tracks every mesh peer the local node has observed.
pub struct NodeRegistry {
    records: HashMap<NodeId, NodeRecord>,
    snr_change_threshold: f32,
    events: EventBus,
}

impl NodeRegistry {
    /// Create a registry that publishes `NodeSeen` events on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            records: HashMap::new(),
            snr_change_threshold: DEFAULT_SNR_CHANGE_THRESHOLD,
            events,
        }
    }

    /// Override the SNR-change threshold that triggers a repeat `NodeSeen`.
    pub fn with_snr_change_threshold(mut self, threshold: f32) -> Self {
        self.snr_change_threshold = threshold;
        self
    }

    /// Record an observation of `id` from any inbound frame, regardless of
    /// frame kind. Emits `NodeSeen` if `id` is new, or if its SNR moved by
    /// more than the configured threshold.
    pub fn observe(&mut self, id: NodeId, link: LinkMetrics, now: Instant) {
        match self.records.get_mut(&id) {
            Some(record) => {
                let snr_delta = (link.snr - record.last_snr).abs();
                record.last_heard_at = now;
                record.last_snr = link.snr;
                record.last_rssi = link.rssi;
                if snr_delta > self.snr_change_threshold {
                    self.events.publish(Event::NodeSeen { node: id, snr: link.snr });
                }
            }
            None => {
                self.records.insert(id.clone(), NodeRecord::new(id.clone(), link, now));
                self.events.publish(Event::NodeSeen { node: id, snr: link.snr });
            }
        }
    }

    /// Record a PONG reply: identical to [`Self::observe`], plus updating
    /// `display_name` from the reply's `name` field.
    pub fn observe_pong(&mut self, id: NodeId, name: String, link: LinkMetrics, now: Instant) {
        self.observe(id.clone(), link, now);
        if let Some(record) = self.records.get_mut(&id) {
            record.display_name = Some(name);
        }
    }

    /// Look up a node's record.
    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.get(id)
    }

    /// All known nodes, in arbitrary order.
    pub fn all(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values()
    }

    /// All nodes considered active at `now` under `window`.
    pub fn active_nodes(&self, now: Instant, window: Duration) -> impl Iterator<Item = &NodeRecord> {
        self.records.values().filter(move |r| r.is_active(now, window))
    }

    /// Number of known nodes (active or stale).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry has observed any node yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn link(snr: f32) -> LinkMetrics {
        LinkMetrics { snr, rssi: -80, hop_count: 1 }
    }

    #[test]
    fn test_first_observation_creates_record_and_emits_node_seen() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let mut registry = NodeRegistry::new(bus);
        let now = Instant::now();

        registry.observe(NodeId::new("n1"), link(10.0), now);

        let record = registry.get(&NodeId::new("n1")).unwrap();
        assert_eq!(record.last_snr, 10.0);
        assert_eq!(record.display_name, None);
        assert_eq!(registry.len(), 1);
        assert_eq!(sub.try_recv(), Some(Event::NodeSeen { node: NodeId::new("n1"), snr: 10.0 }));
    }

    #[test]
    fn test_repeat_observation_without_snr_jump_does_not_re_emit() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let mut registry = NodeRegistry::new(bus);
        let now = Instant::now();

        registry.observe(NodeId::new("n1"), link(10.0), now);
        sub.try_recv(); // drain the first NodeSeen

        registry.observe(NodeId::new("n1"), link(10.5), now);
        assert_eq!(sub.try_recv(), None);
        assert_eq!(registry.get(&NodeId::new("n1")).unwrap().last_snr, 10.5);
    }

    #[test]
    fn test_large_snr_jump_re_emits_node_seen() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let mut registry = NodeRegistry::new(bus).with_snr_change_threshold(5.0);
        let now = Instant::now();

        registry.observe(NodeId::new("n1"), link(10.0), now);
        sub.try_recv();

        registry.observe(NodeId::new("n1"), link(2.0), now);
        assert_eq!(sub.try_recv(), Some(Event::NodeSeen { node: NodeId::new("n1"), snr: 2.0 }));
    }

    #[test]
    fn test_pong_updates_display_name() {
        let bus = EventBus::new();
        let mut registry = NodeRegistry::new(bus);
        let now = Instant::now();

        registry.observe_pong(NodeId::new("n1"), "basestation".into(), link(8.0), now);

        let record = registry.get(&NodeId::new("n1")).unwrap();
        assert_eq!(record.display_name, Some("basestation".into()));
    }

    #[test]
    fn test_node_active_window() {
        let bus = EventBus::new();
        let mut registry = NodeRegistry::new(bus);
        let now = Instant::now();
        registry.observe(NodeId::new("n1"), link(10.0), now);

        let record = registry.get(&NodeId::new("n1")).unwrap().clone();
        assert!(record.is_active(now, Duration::from_secs(600)));

        let later = now + Duration::from_secs(601);
        assert!(!record.is_active(later, Duration::from_secs(600)));
    }

    #[test]
    fn test_stale_node_stays_in_registry() {
        let bus = EventBus::new();
        let mut registry = NodeRegistry::new(bus);
        let now = Instant::now();
        registry.observe(NodeId::new("n1"), link(10.0), now);

        let later = now + Duration::from_secs(10_000);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_nodes(later, Duration::from_secs(600)).count(), 0);
        assert!(registry.get(&NodeId::new("n1")).is_some());
    }

    #[test]
    fn test_multiple_nodes_tracked_independently() {
        let bus = EventBus::new();
        let mut registry = NodeRegistry::new(bus);
        let now = Instant::now();

        registry.observe(NodeId::new("n1"), link(5.0), now);
        registry.observe(NodeId::new("n2"), link(15.0), now);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&NodeId::new("n1")).unwrap().last_snr, 5.0);
        assert_eq!(registry.get(&NodeId::new("n2")).unwrap().last_snr, 15.0);
    }
}
