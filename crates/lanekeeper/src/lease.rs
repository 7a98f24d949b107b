// Exclusive lease arbitration for the premium lane
//
// At most one requester holds the lease at any instant. Everyone else waits in
// a priority queue (lower band value = more urgent, FIFO within a band) and is
// woken through a oneshot channel when a release promotes them. Waiters queued
// longer than `max_wait` are aged into the most urgent band before every
// promotion so low-priority requests cannot starve.
//
// All mutations of the holder slot and the queue happen under a single mutex
// that is never held across an await point.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::LeaseConfig;
use crate::error::{ConfigError, LeaseError, LeaseResult};
use crate::events::{CoordinationEvent, EventBus, ReleaseReason};
use crate::queue::{Priority, PriorityQueue, QueueTicket};

/// Identifier of a lease requester (an agent, a session, a worker)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(String);

impl RequesterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequesterId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequesterId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for RequesterId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exclusive ownership of the lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: u64,
    pub holder: RequesterId,
    /// Band the lease was granted from
    pub priority: Priority,
    pub acquired_at: Instant,
    pub granted_at: DateTime<Utc>,
    pub deadline: Option<Instant>,
}

impl Lease {
    /// Whether the deadline has passed at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| now >= deadline)
    }
}

/// Per-call acquire settings; unset fields fall back to [`LeaseConfig`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// How long to wait in the queue
    pub timeout: Option<Duration>,
    /// How long the lease lives once granted
    pub lease_ttl: Option<Duration>,
    /// Absolute expiry of the lease; wins over `lease_ttl`
    pub deadline: Option<Instant>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Liveness check for the current holder, consulted by
/// [`ExclusiveResourceManager::reap_failed_holder`]
#[async_trait]
pub trait HolderHealthCheck: Send + Sync {
    async fn is_alive(&self, lease: &Lease) -> bool;
}

/// Current holder as reported by [`ExclusiveResourceManager::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderSummary {
    pub lease_id: u64,
    pub requester: RequesterId,
    pub priority: Priority,
    pub held_ms: u64,
    pub remaining_ms: Option<u64>,
    pub expired: bool,
}

/// One queued waiter as reported by [`ExclusiveResourceManager::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaiterSummary {
    pub requester: RequesterId,
    pub requested_priority: Priority,
    pub effective_priority: Priority,
    pub waited_ms: u64,
}

/// Snapshot of the lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseStatus {
    pub holder: Option<HolderSummary>,
    pub queue_depth: usize,
    /// Waiters in service order
    pub waiters: Vec<WaiterSummary>,
}

struct Waiter {
    requester: RequesterId,
    requested: Priority,
    enqueued_at: Instant,
    lease_ttl: Option<Duration>,
    deadline: Option<Instant>,
    grant: oneshot::Sender<LeaseResult<Lease>>,
}

struct LeaseState {
    holder: Option<Lease>,
    waiters: PriorityQueue<Waiter>,
    tickets: HashMap<RequesterId, QueueTicket>,
    next_lease_id: u64,
}

impl LeaseState {
    fn is_holder(&self, requester: &str) -> bool {
        self.holder
            .as_ref()
            .map_or(false, |lease| lease.holder.as_str() == requester)
    }

    fn issue(
        &mut self,
        holder: RequesterId,
        priority: Priority,
        ttl: Option<Duration>,
        deadline: Option<Instant>,
        now: Instant,
    ) -> Lease {
        self.next_lease_id += 1;
        Lease {
            id: self.next_lease_id,
            holder,
            priority,
            acquired_at: now,
            granted_at: Utc::now(),
            deadline: deadline.or_else(|| ttl.map(|ttl| now + ttl)),
        }
    }
}

/// Side effects gathered inside the critical section and applied after it
#[derive(Default)]
struct Effects {
    events: Vec<CoordinationEvent>,
    watchdogs: Vec<(u64, Instant)>,
}

struct ManagerInner {
    config: LeaseConfig,
    clock: SharedClock,
    events: Arc<EventBus>,
    health_check: Option<Arc<dyn HolderHealthCheck>>,
    state: Mutex<LeaseState>,
}

/// Builder for [`ExclusiveResourceManager`]
pub struct LeaseManagerBuilder {
    config: LeaseConfig,
    clock: Option<SharedClock>,
    events: Option<Arc<EventBus>>,
    health_check: Option<Arc<dyn HolderHealthCheck>>,
}

impl LeaseManagerBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn health_check(mut self, check: Arc<dyn HolderHealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Fails when the lease config does not validate
    pub fn build(self) -> Result<ExclusiveResourceManager, ConfigError> {
        self.config.validate()?;
        Ok(ExclusiveResourceManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                clock: self.clock.unwrap_or_else(SystemClock::shared),
                events: self.events.unwrap_or_else(EventBus::shared),
                health_check: self.health_check,
                state: Mutex::new(LeaseState {
                    holder: None,
                    waiters: PriorityQueue::new(),
                    tickets: HashMap::new(),
                    next_lease_id: 0,
                }),
            }),
        })
    }
}

/// Single-seat lease manager with priority queueing and aging.
///
/// Cloning is cheap; clones share the same lane.
#[derive(Clone)]
pub struct ExclusiveResourceManager {
    inner: Arc<ManagerInner>,
}

impl ExclusiveResourceManager {
    /// Manager on the wall clock with a private event bus
    pub fn new(config: LeaseConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: LeaseConfig) -> LeaseManagerBuilder {
        LeaseManagerBuilder {
            config,
            clock: None,
            events: None,
            health_check: None,
        }
    }

    /// Event bus this manager publishes on
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.inner.config
    }

    /// Acquire the lease, waiting in the queue if it is held.
    ///
    /// When the lane is free the lease is granted before the first suspension
    /// point. Dropping the returned future withdraws the request; a grant that
    /// raced the drop is released again.
    pub async fn acquire(
        &self,
        requester: impl Into<RequesterId>,
        priority: Priority,
        options: AcquireOptions,
    ) -> LeaseResult<Lease> {
        let requester = requester.into();
        let timeout = options.timeout.or(self.inner.config.default_timeout());
        let lease_ttl = options.lease_ttl.or(self.inner.config.default_lease_ttl());

        let mut effects = Effects::default();
        let (entered, enqueued_at) = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            self.inner.expire_if_due(&mut state, now, &mut effects);

            if state.is_holder(requester.as_str()) || state.tickets.contains_key(&requester) {
                (Err(LeaseError::duplicate(requester.as_str())), now)
            } else if state.holder.is_none() && state.waiters.is_empty() {
                let lease = state.issue(requester.clone(), priority, lease_ttl, options.deadline, now);
                self.inner.install(&mut state, lease.clone(), &mut effects);
                (Ok(Entered::Granted(lease)), now)
            } else {
                let (grant, receiver) = oneshot::channel();
                let ticket = state.waiters.enqueue(
                    Waiter {
                        requester: requester.clone(),
                        requested: priority,
                        enqueued_at: now,
                        lease_ttl,
                        deadline: options.deadline,
                        grant,
                    },
                    priority,
                );
                state.tickets.insert(requester.clone(), ticket);
                debug!(requester = %requester, %priority, queue_depth = state.waiters.len(), "lease busy, waiter queued");
                effects.events.push(CoordinationEvent::WaiterQueued {
                    requester: requester.clone(),
                    priority,
                    queue_depth: state.waiters.len(),
                });
                (Ok(Entered::Queued(receiver)), now)
            }
        };
        ManagerInner::apply(&self.inner, effects);

        let receiver = match entered? {
            Entered::Granted(lease) => return Ok(lease),
            Entered::Queued(receiver) => receiver,
        };

        let mut pending = PendingGrant {
            manager: Arc::downgrade(&self.inner),
            requester: requester.clone(),
            receiver: Some(receiver),
        };

        match timeout {
            None => pending.recv().await,
            Some(timeout) => {
                let deadline = enqueued_at + timeout;
                let outcome = tokio::select! {
                    biased;
                    outcome = pending.recv() => Some(outcome),
                    _ = self.inner.clock.sleep_until(deadline) => None,
                };
                match outcome {
                    Some(outcome) => outcome,
                    None => self.inner.time_out(&mut pending, enqueued_at),
                }
            }
        }
    }

    /// Take the lease only if it is free right now; never queues
    pub fn try_acquire(
        &self,
        requester: impl Into<RequesterId>,
        priority: Priority,
        lease_ttl: Option<Duration>,
    ) -> LeaseResult<Option<Lease>> {
        let requester = requester.into();
        let lease_ttl = lease_ttl.or(self.inner.config.default_lease_ttl());

        let mut effects = Effects::default();
        let outcome = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            self.inner.expire_if_due(&mut state, now, &mut effects);

            if state.is_holder(requester.as_str()) || state.tickets.contains_key(&requester) {
                Err(LeaseError::duplicate(requester.as_str()))
            } else if state.holder.is_none() && state.waiters.is_empty() {
                let lease = state.issue(requester, priority, lease_ttl, None, now);
                self.inner.install(&mut state, lease.clone(), &mut effects);
                Ok(Some(lease))
            } else {
                Ok(None)
            }
        };
        ManagerInner::apply(&self.inner, effects);
        outcome
    }

    /// Release the lease held by `requester` and promote the next waiter.
    ///
    /// Fails with `NotHolder` when `requester` does not hold the lease, which
    /// includes a second release of the same lease.
    pub fn release(&self, requester: &str) -> LeaseResult<Lease> {
        let mut effects = Effects::default();
        let outcome = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            self.inner.expire_if_due(&mut state, now, &mut effects);

            if state.is_holder(requester) {
                Ok(self
                    .inner
                    .vacate(&mut state, now, ReleaseReason::Released, &mut effects))
            } else {
                Err(LeaseError::not_holder(requester))
            }
        };
        ManagerInner::apply(&self.inner, effects);

        let released = outcome?;
        released.ok_or_else(|| LeaseError::not_holder(requester))
    }

    /// Release exactly the lease `lease_id` and promote the next waiter.
    ///
    /// Fails with `StaleLease` when that lease already ended, even if its
    /// requester has since been granted a newer one.
    pub fn release_lease(&self, lease_id: u64) -> LeaseResult<Lease> {
        let mut effects = Effects::default();
        let released = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            self.inner.expire_if_due(&mut state, now, &mut effects);

            if state.holder.as_ref().map_or(false, |lease| lease.id == lease_id) {
                self.inner
                    .vacate(&mut state, now, ReleaseReason::Released, &mut effects)
            } else {
                None
            }
        };
        ManagerInner::apply(&self.inner, effects);
        released.ok_or_else(|| LeaseError::stale(lease_id))
    }

    /// Withdraw a queued request. Returns false if `requester` was not queued.
    pub fn cancel(&self, requester: &str) -> bool {
        let mut effects = Effects::default();
        let cancelled = {
            let mut state = self.inner.state.lock();
            match state.tickets.remove(requester) {
                Some(ticket) => match state.waiters.remove(ticket) {
                    Some(waiter) => {
                        debug!(requester = %waiter.requester, "lease waiter cancelled");
                        let _ = waiter.grant.send(Err(LeaseError::cancelled(requester)));
                        effects.events.push(CoordinationEvent::WaiterCancelled {
                            requester: waiter.requester,
                        });
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        ManagerInner::apply(&self.inner, effects);
        cancelled
    }

    /// Free the lease regardless of who holds it and promote the next waiter
    pub fn force_release(&self, reason: &str) -> Option<Lease> {
        self.inner.vacate_if(None, ReleaseReason::Forced, Some(reason))
    }

    /// Ask the health check whether the holder is alive; if not, free the
    /// lease exactly like a release. No-op without a health check.
    pub async fn reap_failed_holder(&self) -> Option<Lease> {
        let check = self.inner.health_check.clone()?;
        let lease = self.holder()?;
        if check.is_alive(&lease).await {
            return None;
        }
        self.inner
            .vacate_if(Some(lease.id), ReleaseReason::HolderFailed, Some("health check failed"))
    }

    /// Free the lease if its deadline has passed
    pub fn expire_stale(&self) -> Option<Lease> {
        let mut effects = Effects::default();
        let expired = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            self.inner.expire_if_due(&mut state, now, &mut effects)
        };
        ManagerInner::apply(&self.inner, effects);
        expired
    }

    /// Current lease, if any
    pub fn holder(&self) -> Option<Lease> {
        self.inner.state.lock().holder.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Side-effect free snapshot of the holder and the queue
    pub fn status(&self) -> LeaseStatus {
        let state = self.inner.state.lock();
        let now = self.inner.clock.now();

        let holder = state.holder.as_ref().map(|lease| HolderSummary {
            lease_id: lease.id,
            requester: lease.holder.clone(),
            priority: lease.priority,
            held_ms: millis(now.saturating_duration_since(lease.acquired_at)),
            remaining_ms: lease
                .deadline
                .map(|deadline| millis(deadline.saturating_duration_since(now))),
            expired: lease.is_expired_at(now),
        });

        let waiters = state
            .waiters
            .iter()
            .map(|(_, effective, waiter)| WaiterSummary {
                requester: waiter.requester.clone(),
                requested_priority: waiter.requested,
                effective_priority: effective,
                waited_ms: millis(now.saturating_duration_since(waiter.enqueued_at)),
            })
            .collect();

        LeaseStatus {
            holder,
            queue_depth: state.waiters.len(),
            waiters,
        }
    }
}

impl fmt::Debug for ExclusiveResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ExclusiveResourceManager")
            .field("holder", &state.holder.as_ref().map(|l| l.holder.as_str()))
            .field("queue_depth", &state.waiters.len())
            .finish()
    }
}

enum Entered {
    Granted(Lease),
    Queued(oneshot::Receiver<LeaseResult<Lease>>),
}

impl ManagerInner {
    /// Make `lease` the current holder
    fn install(&self, state: &mut LeaseState, lease: Lease, effects: &mut Effects) {
        info!(lease_id = lease.id, holder = %lease.holder, priority = %lease.priority, "lease granted");
        effects.events.push(CoordinationEvent::LeaseGranted {
            lease_id: lease.id,
            holder: lease.holder.clone(),
            priority: lease.priority,
        });
        if let Some(deadline) = lease.deadline {
            effects.watchdogs.push((lease.id, deadline));
        }
        state.holder = Some(lease);
    }

    /// Clear the holder slot and hand the lease to the next live waiter
    fn vacate(
        &self,
        state: &mut LeaseState,
        now: Instant,
        reason: ReleaseReason,
        effects: &mut Effects,
    ) -> Option<Lease> {
        let released = state.holder.take()?;
        let held_ms = millis(now.saturating_duration_since(released.acquired_at));
        info!(lease_id = released.id, holder = %released.holder, ?reason, held_ms, "lease released");
        effects.events.push(CoordinationEvent::LeaseReleased {
            lease_id: released.id,
            holder: released.holder.clone(),
            reason,
            held_ms,
        });
        self.promote_next(state, now, effects);
        Some(released)
    }

    fn vacate_if(
        self: &Arc<Self>,
        lease_id: Option<u64>,
        reason: ReleaseReason,
        note: Option<&str>,
    ) -> Option<Lease> {
        let mut effects = Effects::default();
        let released = {
            let mut state = self.state.lock();
            let matches = match (&state.holder, lease_id) {
                (Some(_), None) => true,
                (Some(lease), Some(id)) => lease.id == id,
                (None, _) => false,
            };
            if matches {
                if let Some(note) = note {
                    warn!(?reason, note, "freeing lease without holder release");
                }
                let now = self.clock.now();
                self.vacate(&mut state, now, reason, &mut effects)
            } else {
                None
            }
        };
        Self::apply(self, effects);
        released
    }

    fn expire_if_due(&self, state: &mut LeaseState, now: Instant, effects: &mut Effects) -> Option<Lease> {
        let due = state
            .holder
            .as_ref()
            .map_or(false, |lease| lease.is_expired_at(now));
        if due {
            self.vacate(state, now, ReleaseReason::Expired, effects)
        } else {
            None
        }
    }

    fn age_waiters(&self, state: &mut LeaseState, now: Instant) {
        let Some(max_wait) = self.config.max_wait() else {
            return;
        };
        let aged = state.waiters.age_where(Priority::CRITICAL, |waiter| {
            now.saturating_duration_since(waiter.enqueued_at) >= max_wait
        });
        if aged > 0 {
            debug!(aged, max_wait_ms = millis(max_wait), "aged starving lease waiters");
        }
    }

    fn promote_next(&self, state: &mut LeaseState, now: Instant, effects: &mut Effects) {
        self.age_waiters(state, now);

        while let Some((_, served_from, waiter)) = state.waiters.dequeue_highest_entry() {
            state.tickets.remove(&waiter.requester);

            // The acquire future was dropped; skip it without granting.
            if waiter.grant.is_closed() {
                debug!(requester = %waiter.requester, "skipping abandoned lease waiter");
                effects.events.push(CoordinationEvent::WaiterCancelled {
                    requester: waiter.requester,
                });
                continue;
            }

            let lease = state.issue(
                waiter.requester.clone(),
                served_from,
                waiter.lease_ttl,
                waiter.deadline,
                now,
            );
            if waiter.grant.send(Ok(lease.clone())).is_err() {
                effects.events.push(CoordinationEvent::WaiterCancelled {
                    requester: waiter.requester,
                });
                continue;
            }

            effects.events.push(CoordinationEvent::WaiterPromoted {
                requester: waiter.requester,
                priority: served_from,
                waited_ms: millis(now.saturating_duration_since(waiter.enqueued_at)),
            });
            self.install(state, lease, effects);
            return;
        }
    }

    /// Settle a queued acquire whose timeout fired
    fn time_out(self: &Arc<Self>, pending: &mut PendingGrant, enqueued_at: Instant) -> LeaseResult<Lease> {
        let mut effects = Effects::default();
        let requester = pending.requester.clone();
        let outcome = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let waited_ms = millis(now.saturating_duration_since(enqueued_at));

            match state.tickets.remove(&requester) {
                Some(ticket) => {
                    state.waiters.remove(ticket);
                    pending.receiver = None;
                    warn!(requester = %requester, waited_ms, "lease waiter timed out");
                    effects.events.push(CoordinationEvent::WaiterTimedOut {
                        requester: requester.clone(),
                        waited_ms,
                    });
                    Err(LeaseError::timeout(requester.as_str(), waited_ms))
                }
                // Promoted or cancelled in the same tick; the channel already
                // holds the outcome and it wins over the timeout.
                None => pending.take_settled(),
            }
        };
        Self::apply(self, effects);
        outcome
    }

    fn apply(inner: &Arc<Self>, effects: Effects) {
        for (lease_id, deadline) in effects.watchdogs {
            Self::arm_watchdog(inner, lease_id, deadline);
        }
        inner.events.emit_all(effects.events);
    }

    /// Expire the lease at its deadline even if nobody touches the manager
    fn arm_watchdog(inner: &Arc<Self>, lease_id: u64, deadline: Instant) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Outside a runtime expiry stays lazy: the next call notices it.
            return;
        };
        let manager = Arc::downgrade(inner);
        let clock = inner.clock.clone();
        runtime.spawn(async move {
            clock.sleep_until(deadline).await;
            if let Some(inner) = manager.upgrade() {
                let mut effects = Effects::default();
                {
                    let mut state = inner.state.lock();
                    let still_held = state.holder.as_ref().map_or(false, |l| l.id == lease_id);
                    if still_held {
                        let now = inner.clock.now();
                        inner.expire_if_due(&mut state, now, &mut effects);
                    }
                }
                Self::apply(&inner, effects);
            }
        });
    }
}

/// Receiving side of a queued acquire.
///
/// Dropping it before the outcome was read withdraws the waiter, or releases
/// the lease if a grant was already delivered.
struct PendingGrant {
    manager: Weak<ManagerInner>,
    requester: RequesterId,
    receiver: Option<oneshot::Receiver<LeaseResult<Lease>>>,
}

impl PendingGrant {
    async fn recv(&mut self) -> LeaseResult<Lease> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(LeaseError::cancelled(self.requester.as_str()));
        };
        let outcome = receiver.await;
        self.receiver = None;
        match outcome {
            Ok(result) => result,
            // Sender dropped without an answer: the manager went away.
            Err(_) => Err(LeaseError::cancelled(self.requester.as_str())),
        }
    }

    fn take_settled(&mut self) -> LeaseResult<Lease> {
        match self.receiver.take().map(|mut receiver| receiver.try_recv()) {
            Some(Ok(result)) => result,
            _ => Err(LeaseError::cancelled(self.requester.as_str())),
        }
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        let Some(inner) = self.manager.upgrade() else {
            return;
        };

        match receiver.try_recv() {
            Ok(Ok(lease)) => {
                debug!(requester = %self.requester, lease_id = lease.id, "acquire dropped after grant, releasing");
                inner.vacate_if(Some(lease.id), ReleaseReason::Abandoned, None);
            }
            Ok(Err(_)) => {}
            Err(_) => {
                let mut effects = Effects::default();
                {
                    let mut state = inner.state.lock();
                    if let Some(ticket) = state.tickets.remove(&self.requester) {
                        state.waiters.remove(ticket);
                        effects.events.push(CoordinationEvent::WaiterCancelled {
                            requester: self.requester.clone(),
                        });
                    }
                }
                ManagerInner::apply(&inner, effects);
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::EventRecorder;

    fn manager(clock: &Arc<ManualClock>) -> ExclusiveResourceManager {
        ExclusiveResourceManager::builder(LeaseConfig::new().with_max_wait(None))
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_free_lane_grants_immediately() {
        let clock = ManualClock::shared();
        let lanes = manager(&clock);
        let recorder = EventRecorder::attach(lanes.events());

        let lease = lanes.acquire("a", Priority::NORMAL, AcquireOptions::new()).await.unwrap();
        assert_eq!(lease.holder.as_str(), "a");
        assert_eq!(lease.id, 1);
        assert_eq!(lanes.holder().map(|l| l.id), Some(1));
        assert_eq!(recorder.kinds(), vec!["lease_granted"]);
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected() {
        let clock = ManualClock::shared();
        let lanes = manager(&clock);
        lanes.acquire("a", Priority::NORMAL, AcquireOptions::new()).await.unwrap();

        let err = lanes.acquire("a", Priority::HIGH, AcquireOptions::new()).await.unwrap_err();
        assert_eq!(err, LeaseError::duplicate("a"));
        assert_eq!(lanes.try_acquire("a", Priority::HIGH, None), Err(LeaseError::duplicate("a")));
    }

    #[tokio::test]
    async fn test_try_acquire_never_queues() {
        let clock = ManualClock::shared();
        let lanes = manager(&clock);
        assert!(lanes.try_acquire("a", Priority::NORMAL, None).unwrap().is_some());
        assert_eq!(lanes.try_acquire("b", Priority::CRITICAL, None).unwrap(), None);
        assert_eq!(lanes.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_release_by_non_holder() {
        let clock = ManualClock::shared();
        let lanes = manager(&clock);
        lanes.acquire("a", Priority::NORMAL, AcquireOptions::new()).await.unwrap();

        assert_eq!(lanes.release("b"), Err(LeaseError::not_holder("b")));
        assert!(lanes.release("a").is_ok());
        assert_eq!(lanes.release("a"), Err(LeaseError::not_holder("a")));
        assert!(lanes.holder().is_none());
    }

    #[tokio::test]
    async fn test_release_lease_ignores_newer_lease_of_same_requester() {
        let clock = ManualClock::shared();
        let lanes = manager(&clock);
        let first = lanes
            .try_acquire("a", Priority::NORMAL, Some(Duration::from_millis(10)))
            .unwrap()
            .unwrap();
        clock.advance(Duration::from_millis(10));
        let second = lanes.try_acquire("a", Priority::NORMAL, None).unwrap().unwrap();

        assert_eq!(lanes.release_lease(first.id), Err(LeaseError::stale(first.id)));
        assert_eq!(lanes.holder().map(|l| l.id), Some(second.id));
        assert_eq!(lanes.release_lease(second.id).map(|l| l.id), Ok(second.id));
        assert!(lanes.holder().is_none());
    }

    #[tokio::test]
    async fn test_lazy_expiry_outside_watchdog() {
        let clock = ManualClock::shared();
        let lanes = manager(&clock);
        let lease = lanes
            .try_acquire("a", Priority::NORMAL, Some(Duration::from_millis(100)))
            .unwrap()
            .unwrap();
        assert_eq!(lease.deadline, Some(lease.acquired_at + Duration::from_millis(100)));

        clock.advance(Duration::from_millis(100));
        let status = lanes.status();
        assert!(status.holder.as_ref().unwrap().expired);
        assert_eq!(status.holder.unwrap().remaining_ms, Some(0));

        assert_eq!(lanes.expire_stale().map(|l| l.id), Some(lease.id));
        assert!(lanes.holder().is_none());
        assert_eq!(lanes.release("a"), Err(LeaseError::not_holder("a")));
    }

    #[tokio::test]
    async fn test_explicit_deadline_wins_over_ttl() {
        let clock = ManualClock::shared();
        let lanes = manager(&clock);
        let deadline = clock.now() + Duration::from_millis(20);
        let lease = lanes
            .acquire(
                "a",
                Priority::NORMAL,
                AcquireOptions::new()
                    .with_lease_ttl(Duration::from_secs(60))
                    .with_deadline(deadline),
            )
            .await
            .unwrap();
        assert_eq!(lease.deadline, Some(deadline));
    }

    #[test]
    fn test_requester_id_conversions() {
        let id = RequesterId::from("agent-7");
        assert_eq!(id.to_string(), "agent-7");
        assert_eq!(RequesterId::from(String::from("agent-7")), id);
        let mut map = HashMap::new();
        map.insert(id, 1);
        assert_eq!(map.get("agent-7"), Some(&1));
    }
}
