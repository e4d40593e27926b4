//! # Event Bus
//!
//! A fan-out of typed events consumed by external observers (the excluded
//! TUI, in particular). Subscribers are non-blocking: a slow subscriber
//! gets a bounded queue and loses its oldest unread event on overflow
//! rather than stalling the protocol engine. See SPEC_FULL.md §4.7.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::mesh_port::NodeId;

/// Default bound on a subscriber's event queue.
pub const DEFAULT_SUBSCRIBER_QUEUE_LEN: usize = 256;

/// A typed protocol-engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A node was observed for the first time, or its link quality moved
    /// enough to be worth reporting.
    NodeSeen {
        /// The node observed.
        node: NodeId,
        /// Its most recently reported SNR.
        snr: f32,
    },
    /// A sender session started a new transfer.
    TransferStarted {
        /// Transfer id.
        tid: String,
        /// Peer this transfer is with.
        peer: NodeId,
        /// Total chunk count.
        total_chunks: u16,
    },
    /// A DATA frame was sent (first send or a retransmit).
    ChunkSent {
        /// Transfer id.
        tid: String,
        /// Chunk index sent.
        idx: u16,
    },
    /// An ACK was received for a chunk.
    ChunkAcked {
        /// Transfer id.
        tid: String,
        /// Chunk index acknowledged.
        idx: u16,
    },
    /// A chunk's watchdog fired without an ACK.
    ChunkTimedOut {
        /// Transfer id.
        tid: String,
        /// Chunk index that timed out.
        idx: u16,
    },
    /// Progress update: `done` out of `total` chunks sent or received.
    TransferProgress {
        /// Transfer id.
        tid: String,
        /// Chunks sent (sender side) or received (receiver side) so far.
        done: u16,
        /// Total chunk count.
        total: u16,
    },
    /// A transfer reached a terminal success state.
    TransferCompleted {
        /// Transfer id.
        tid: String,
    },
    /// A transfer reached a terminal failure state.
    TransferFailed {
        /// Transfer id.
        tid: String,
        /// Human-readable failure reason.
        reason: String,
    },
    /// A free-text log line, for observers that want engine diagnostics
    /// without subscribing to `tracing` directly.
    LogLine {
        /// Severity, as a short lowercase tag (`"debug"`, `"info"`, `"warn"`, `"error"`).
        level: &'static str,
        /// Message text.
        text: String,
    },
}

/// A single subscriber's bounded ring buffer. A plain `VecDeque` behind a
/// lock, rather than a channel, because the overflow policy needs to evict
/// the *oldest* queued event — something `tokio::sync::mpsc` has no way to
/// express.
struct Inbox {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

/// Typed event fan-out. Cheap to clone; all clones share the same
/// subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<Inbox>>>>,
}

/// A subscriber's receiving half, plus a live view of how many events it
/// has dropped to overflow.
pub struct Subscription {
    inbox: Arc<Inbox>,
}

impl Subscription {
    /// Receive the next event, waiting if none is queued yet. Never
    /// returns `None`: the bus outlives individual subscriptions for the
    /// lifetime of the engine.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.inbox.queue.lock().pop_front() {
                return Some(event);
            }
            self.inbox.notify.notified().await;
        }
    }

    /// Drain whatever is currently queued without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.inbox.queue.lock().pop_front()
    }

    /// Number of events dropped because this subscriber's queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.inbox.dropped.load(Ordering::Relaxed)
    }
}

impl EventBus {
    /// Create a new, empty event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with the given queue bound.
    pub fn subscribe_bounded(&self, capacity: usize) -> Subscription {
        let inbox = Arc::new(Inbox {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        self.subscribers.lock().push(inbox.clone());
        Subscription { inbox }
    }

    /// Register a new subscriber with the default queue bound.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_bounded(DEFAULT_SUBSCRIBER_QUEUE_LEN)
    }

    /// Publish an event to every subscriber. Never blocks: a subscriber
    /// whose queue is already at capacity has its oldest event evicted to
    /// make room for this one, and its drop counter is incremented.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock();
        for inbox in subscribers.iter() {
            let mut queue = inbox.queue.lock();
            if queue.len() >= inbox.capacity {
                queue.pop_front();
                inbox.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event.clone());
            drop(queue);
            inbox.notify.notify_waiters();
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(Event::TransferStarted {
            tid: "t1".into(),
            peer: NodeId::new("b"),
            total_chunks: 3,
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(
            event,
            Event::TransferStarted {
                tid: "t1".into(),
                peer: NodeId::new("b"),
                total_chunks: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut sub_a = bus.subscribe();
        let mut sub_b = bus.subscribe();

        bus.publish(Event::TransferCompleted { tid: "t1".into() });

        assert_eq!(sub_a.recv().await, Some(Event::TransferCompleted { tid: "t1".into() }));
        assert_eq!(sub_b.recv().await, Some(Event::TransferCompleted { tid: "t1".into() }));
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts_it() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_bounded(2);

        bus.publish(Event::ChunkSent { tid: "t1".into(), idx: 0 });
        bus.publish(Event::ChunkSent { tid: "t1".into(), idx: 1 });
        bus.publish(Event::ChunkSent { tid: "t1".into(), idx: 2 });

        assert_eq!(sub.dropped_count(), 1);
        // idx 0 was evicted; idx 1 and idx 2 remain, oldest-first.
        assert_eq!(sub.try_recv(), Some(Event::ChunkSent { tid: "t1".into(), idx: 1 }));
        assert_eq!(sub.try_recv(), Some(Event::ChunkSent { tid: "t1".into(), idx: 2 }));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::LogLine { level: "info", text: "hello".into() });
    }
}
