// Deterministic priority queue for lease contention
//
// Items are served by priority band first and arrival order second, so the
// order in which waiters are granted is reproducible for any sequence of
// enqueue/dequeue calls.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Priority band of a request.
///
/// Lower values are more urgent: `Priority::CRITICAL` (0) is served before
/// `Priority::LOW` (3). Any `u8` is a valid band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Most urgent band; aged waiters are promoted here
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);

    /// Create a priority from a raw band (lower = more urgent)
    pub const fn new(level: u8) -> Self {
        Priority(level)
    }

    /// Raw band value
    pub const fn level(self) -> u8 {
        self.0
    }

    /// Whether `self` is served before `other`
    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(level: u8) -> Self {
        Priority(level)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Handle to a queued item, stable across re-prioritisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueTicket(u64);

impl QueueTicket {
    /// Arrival sequence number of the item
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// Min-priority-first queue with FIFO tie-break
#[derive(Debug)]
pub struct PriorityQueue<T> {
    // (band, arrival sequence) -> item
    order: BTreeMap<(Priority, u64), T>,
    // arrival sequence -> current band
    bands: HashMap<u64, Priority>,
    next_sequence: u64,
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            bands: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Add an item behind every item of the same or more urgent band
    pub fn enqueue(&mut self, item: T, priority: Priority) -> QueueTicket {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.order.insert((priority, sequence), item);
        self.bands.insert(sequence, priority);
        QueueTicket(sequence)
    }

    /// Remove and return the most urgent, earliest-enqueued item
    pub fn dequeue_highest(&mut self) -> Option<T> {
        self.dequeue_highest_entry().map(|(_, _, item)| item)
    }

    /// Like [`dequeue_highest`](Self::dequeue_highest), also returning the
    /// ticket and the band the item was served from
    pub fn dequeue_highest_entry(&mut self) -> Option<(QueueTicket, Priority, T)> {
        let ((priority, sequence), item) = self.order.pop_first()?;
        self.bands.remove(&sequence);
        Some((QueueTicket(sequence), priority, item))
    }

    /// Remove a specific item
    pub fn remove(&mut self, ticket: QueueTicket) -> Option<T> {
        let priority = self.bands.remove(&ticket.0)?;
        self.order.remove(&(priority, ticket.0))
    }

    /// Remove the first item (in service order) matching `predicate`
    pub fn remove_first_where<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let key = self
            .order
            .iter()
            .find(|(_, item)| predicate(item))
            .map(|(key, _)| *key)?;
        self.bands.remove(&key.1);
        self.order.remove(&key)
    }

    /// The item that would be dequeued next
    pub fn peek(&self) -> Option<&T> {
        self.order.values().next()
    }

    /// Current band of a queued item
    pub fn priority_of(&self, ticket: QueueTicket) -> Option<Priority> {
        self.bands.get(&ticket.0).copied()
    }

    /// Move an item to another band, keeping its arrival sequence
    pub fn reprioritize(&mut self, ticket: QueueTicket, priority: Priority) -> bool {
        let Some(current) = self.bands.get(&ticket.0).copied() else {
            return false;
        };
        if current == priority {
            return true;
        }
        if let Some(item) = self.order.remove(&(current, ticket.0)) {
            self.order.insert((priority, ticket.0), item);
            self.bands.insert(ticket.0, priority);
        }
        true
    }

    /// Promote every item less urgent than `target` that matches `predicate`
    /// into the `target` band. Returns the number of items moved.
    ///
    /// Promoted items keep their arrival sequence, so among themselves and
    /// relative to later arrivals in `target` they stay in FIFO order.
    pub fn age_where<F>(&mut self, target: Priority, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let due: Vec<(Priority, u64)> = self
            .order
            .iter()
            .filter(|((priority, _), item)| target.is_more_urgent_than(*priority) && predicate(item))
            .map(|(key, _)| *key)
            .collect();

        for key in &due {
            if let Some(item) = self.order.remove(key) {
                self.order.insert((target, key.1), item);
                self.bands.insert(key.1, target);
            }
        }

        due.len()
    }

    /// Iterate in service order
    pub fn iter(&self) -> impl Iterator<Item = (QueueTicket, Priority, &T)> + '_ {
        self.order
            .iter()
            .map(|((priority, sequence), item)| (QueueTicket(*sequence), *priority, item))
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove every item, returning them in service order
    pub fn drain(&mut self) -> Vec<T> {
        self.bands.clear();
        std::mem::take(&mut self.order).into_values().collect()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Internally synchronised queue for use outside the lease manager
#[derive(Debug)]
pub struct SyncPriorityQueue<T> {
    inner: Mutex<PriorityQueue<T>>,
}

impl<T> SyncPriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PriorityQueue::new()),
        }
    }

    pub fn enqueue(&self, item: T, priority: Priority) -> QueueTicket {
        self.inner.lock().enqueue(item, priority)
    }

    pub fn dequeue_highest(&self) -> Option<T> {
        self.inner.lock().dequeue_highest()
    }

    pub fn remove(&self, ticket: QueueTicket) -> Option<T> {
        self.inner.lock().remove(ticket)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Run `f` with exclusive access to the queue
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut PriorityQueue<T>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<T: Clone> SyncPriorityQueue<T> {
    /// Clone of the item that would be dequeued next
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().peek().cloned()
    }
}

impl<T> Default for SyncPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo_order() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("p3", Priority::new(3));
        queue.enqueue("p1-first", Priority::new(1));
        queue.enqueue("p2", Priority::new(2));
        queue.enqueue("p1-second", Priority::new(1));

        assert_eq!(queue.peek(), Some(&"p1-first"));
        let served: Vec<_> = std::iter::from_fn(|| queue.dequeue_highest()).collect();
        assert_eq!(served, vec!["p1-first", "p1-second", "p2", "p3"]);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue_highest(), None);
    }

    #[test]
    fn test_remove_by_ticket() {
        let mut queue = PriorityQueue::new();
        let a = queue.enqueue('a', Priority::NORMAL);
        let b = queue.enqueue('b', Priority::NORMAL);

        assert_eq!(queue.remove(a), Some('a'));
        assert_eq!(queue.remove(a), None);
        assert_eq!(queue.priority_of(b), Some(Priority::NORMAL));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remove_first_where(|c| *c == 'b'), Some('b'));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_aging_preserves_arrival_order() {
        let mut queue = PriorityQueue::new();
        let old_low = queue.enqueue(("old-low", 10), Priority::LOW);
        queue.enqueue(("critical", 1), Priority::CRITICAL);
        queue.enqueue(("young-low", 1), Priority::LOW);

        let moved = queue.age_where(Priority::CRITICAL, |(_, waited)| *waited >= 10);
        assert_eq!(moved, 1);
        assert_eq!(queue.priority_of(old_low), Some(Priority::CRITICAL));

        // The aged item arrived before the critical one, so it goes first.
        let order: Vec<_> = queue.iter().map(|(_, _, (name, _))| *name).collect();
        assert_eq!(order, vec!["old-low", "critical", "young-low"]);
    }

    #[test]
    fn test_reprioritize() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(1, Priority::HIGH);
        let t = queue.enqueue(2, Priority::LOW);
        assert!(queue.reprioritize(t, Priority::CRITICAL));
        assert_eq!(queue.dequeue_highest_entry(), Some((t, Priority::CRITICAL, 2)));
        assert!(!queue.reprioritize(t, Priority::LOW));
    }

    #[test]
    fn test_sync_queue() {
        let queue = SyncPriorityQueue::new();
        queue.enqueue("b", Priority::LOW);
        queue.enqueue("a", Priority::HIGH);
        assert_eq!(queue.peek(), Some("a"));
        assert_eq!(queue.len(), 2);
        let drained = queue.with_queue(|q| q.drain());
        assert_eq!(drained, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_priority_display_and_order() {
        assert!(Priority::CRITICAL.is_more_urgent_than(Priority::LOW));
        assert_eq!(Priority::default(), Priority::NORMAL);
        assert_eq!(Priority::from(7).to_string(), "p7");
    }
}
