// Coordination events for dashboards and audit trails
//
// Components collect events while holding their own lock and hand them to the
// bus only after the lock is released, so subscribers may call back into the
// manager or the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::lease::RequesterId;
use crate::lifecycle::SpecialistState;
use crate::pool::EntryId;
use crate::queue::Priority;

/// Why a lease ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The holder released it
    Released,
    /// Its deadline passed
    Expired,
    /// An operator forced it free
    Forced,
    /// The health check reported the holder dead
    HolderFailed,
    /// The grant was delivered to an acquire call that had already been dropped
    Abandoned,
}

/// Why an entry left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Lowest usage score under capacity pressure
    Capacity,
    /// Idle longer than its TTL tier
    Expired,
    /// Discarded after a specialist failure
    Failed,
    /// Removed by `clear`
    Cleared,
}

/// Events emitted by the lease manager and the specialist pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinationEvent {
    LeaseGranted {
        lease_id: u64,
        holder: RequesterId,
        priority: Priority,
    },
    LeaseReleased {
        lease_id: u64,
        holder: RequesterId,
        reason: ReleaseReason,
        held_ms: u64,
    },
    WaiterQueued {
        requester: RequesterId,
        priority: Priority,
        queue_depth: usize,
    },
    WaiterPromoted {
        requester: RequesterId,
        /// Band the waiter was served from, after aging
        priority: Priority,
        waited_ms: u64,
    },
    WaiterTimedOut {
        requester: RequesterId,
        waited_ms: u64,
    },
    WaiterCancelled {
        requester: RequesterId,
    },
    PoolHit {
        type_key: String,
        entry_id: EntryId,
    },
    PoolMiss {
        type_key: String,
    },
    PoolEviction {
        type_key: String,
        entry_id: EntryId,
        reason: EvictionReason,
    },
    LifecycleTransition {
        entry_id: EntryId,
        type_key: String,
        from: SpecialistState,
        to: SpecialistState,
        reason: String,
    },
}

impl CoordinationEvent {
    /// Short snake_case name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinationEvent::LeaseGranted { .. } => "lease_granted",
            CoordinationEvent::LeaseReleased { .. } => "lease_released",
            CoordinationEvent::WaiterQueued { .. } => "waiter_queued",
            CoordinationEvent::WaiterPromoted { .. } => "waiter_promoted",
            CoordinationEvent::WaiterTimedOut { .. } => "waiter_timed_out",
            CoordinationEvent::WaiterCancelled { .. } => "waiter_cancelled",
            CoordinationEvent::PoolHit { .. } => "pool_hit",
            CoordinationEvent::PoolMiss { .. } => "pool_miss",
            CoordinationEvent::PoolEviction { .. } => "pool_eviction",
            CoordinationEvent::LifecycleTransition { .. } => "lifecycle_transition",
        }
    }
}

/// An event stamped with its bus sequence number and emission time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CoordinationEvent,
}

/// Observer notified synchronously for every event
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &EventEnvelope);
}

impl<F> EventSubscriber for F
where
    F: Fn(&EventEnvelope) + Send + Sync,
{
    fn on_event(&self, event: &EventEnvelope) {
        self(event)
    }
}

/// Fan-out of coordination events to observers and channel subscribers.
///
/// Channel subscriptions are unbounded, so a slow consumer never loses events.
#[derive(Default)]
pub struct EventBus {
    sequence: AtomicU64,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    channels: Mutex<Vec<mpsc::UnboundedSender<EventEnvelope>>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus wrapped in an `Arc`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register an observer
    pub fn add_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Open a channel receiving every event emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.channels.lock().push(sender);
        receiver
    }

    /// Observers plus open channels
    pub fn subscriber_count(&self) -> usize {
        let mut channels = self.channels.lock();
        channels.retain(|sender| !sender.is_closed());
        self.subscribers.read().len() + channels.len()
    }

    /// Publish one event
    pub fn emit(&self, event: CoordinationEvent) {
        let envelope = EventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event,
        };

        tracing::trace!(kind = envelope.event.kind(), sequence = envelope.sequence, "coordination event");

        for subscriber in self.subscribers.read().iter() {
            subscriber.on_event(&envelope);
        }

        // Closed receivers are pruned as they are discovered.
        self.channels
            .lock()
            .retain(|sender| sender.send(envelope.clone()).is_ok());
    }

    /// Publish a batch collected inside a critical section
    pub fn emit_all(&self, events: impl IntoIterator<Item = CoordinationEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("emitted", &self.sequence.load(Ordering::Relaxed))
            .field("subscribers", &self.subscribers.read().len())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

/// Observer that keeps every event in memory
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<EventEnvelope>>,
}

impl EventRecorder {
    /// Create a recorder and register it on `bus`
    pub fn attach(bus: &EventBus) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        bus.add_subscriber(recorder.clone());
        recorder
    }

    /// Every recorded event
    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.events.lock().iter().map(|e| e.event.clone()).collect()
    }

    /// Kinds of every recorded event, in emission order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event.kind()).collect()
    }

    /// Number of recorded events of one kind
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event.kind() == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSubscriber for EventRecorder {
    fn on_event(&self, event: &EventEnvelope) {
        self.events.lock().push(event.clone());
    }
}
