// Bounded pool of specialist instances
//
// Entries are cached per type key and reused across tasks. Capacity is a hard
// bound on `entries + reservations`: a miss reserves a slot (evicting the
// lowest-scored idle entry if needed) before the factory runs outside the lock.
// Idle entries expire after their type's TTL tier.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::{ExhaustionPolicy, PoolConfig};
use crate::error::{ConfigError, PoolError, PoolResult};
use crate::events::{CoordinationEvent, EventBus, EvictionReason};
use crate::lifecycle::{LifecycleStateMachine, SpecialistState};
use crate::usage::{UsageScore, UsageTracker};

/// Identifier of a pool entry, unique for the lifetime of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit of work handed to a specialist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistTask {
    pub id: String,
    pub input: serde_json::Value,
}

impl SpecialistTask {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self { id: id.into(), input }
    }
}

/// A pooled worker
#[async_trait]
pub trait Specialist: Send + Sync {
    /// Run one task
    async fn execute(&self, task: &SpecialistTask) -> anyhow::Result<serde_json::Value>;

    /// Destroy hook, run once when the entry leaves the pool
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a factory knows about the entry it is building
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryContext {
    pub type_key: String,
    pub entry_id: EntryId,
    /// Entries cached when the slot was reserved
    pub pool_size: usize,
    pub requested_at: DateTime<Utc>,
}

/// Constructs specialists on a pool miss
#[async_trait]
pub trait SpecialistFactory: Send + Sync {
    async fn create(&self, context: &FactoryContext) -> anyhow::Result<Arc<dyn Specialist>>;
}

/// Factory backed by an async closure
pub struct FnFactory<F>(F);

/// Wrap an async closure as a [`SpecialistFactory`]
pub fn factory_fn<F, Fut>(create: F) -> FnFactory<F>
where
    F: Fn(FactoryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Arc<dyn Specialist>>> + Send + 'static,
{
    FnFactory(create)
}

#[async_trait]
impl<F, Fut> SpecialistFactory for FnFactory<F>
where
    F: Fn(FactoryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Arc<dyn Specialist>>> + Send + 'static,
{
    async fn create(&self, context: &FactoryContext) -> anyhow::Result<Arc<dyn Specialist>> {
        (self.0)(context.clone()).await
    }
}

/// A checked-out specialist.
///
/// The handle stays usable after release, but the instance may be handed to
/// another caller at that point.
#[derive(Clone)]
pub struct SpecialistHandle {
    pub entry_id: EntryId,
    pub type_key: String,
    pub instance: Arc<dyn Specialist>,
    /// Served from cache rather than constructed
    pub cache_hit: bool,
}

impl SpecialistHandle {
    pub async fn execute(&self, task: &SpecialistTask) -> anyhow::Result<serde_json::Value> {
        self.instance.execute(task).await
    }
}

impl fmt::Debug for SpecialistHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecialistHandle")
            .field("entry_id", &self.entry_id)
            .field("type_key", &self.type_key)
            .field("cache_hit", &self.cache_hit)
            .finish()
    }
}

/// Counters and occupancy of the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
    /// Slots reserved for constructions in flight
    pub reserved: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub factory_failures: u64,
    pub destroy_failures: u64,
    pub hit_rate: f64,
}

struct PoolEntry {
    id: EntryId,
    type_key: String,
    instance: Arc<dyn Specialist>,
    created_at: Instant,
    lifecycle: LifecycleStateMachine,
    in_use: bool,
    acquire_seq: u64,
}

impl PoolEntry {
    fn handle(&self, cache_hit: bool) -> SpecialistHandle {
        SpecialistHandle {
            entry_id: self.id,
            type_key: self.type_key.clone(),
            instance: self.instance.clone(),
            cache_hit,
        }
    }

    fn transition(
        &mut self,
        next: SpecialistState,
        reason: &str,
        effects: &mut PoolEffects,
    ) -> PoolResult<()> {
        let record = self.lifecycle.transition(next, reason)?;
        effects.events.push(self.lifecycle.event_for(&record));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    factory_failures: u64,
    destroy_failures: u64,
}

struct PoolState {
    entries: HashMap<EntryId, PoolEntry>,
    usage: UsageTracker<EntryId>,
    reserved: usize,
    counters: PoolCounters,
    next_entry_id: u64,
    acquire_seq: u64,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.entries.values().filter(|e| e.in_use).count()
    }

    fn next_acquire_seq(&mut self) -> u64 {
        self.acquire_seq += 1;
        self.acquire_seq
    }
}

/// Instance leaving the pool; its destroy hook runs after the lock is released
struct Doomed {
    entry_id: EntryId,
    type_key: String,
    instance: Arc<dyn Specialist>,
}

#[derive(Default)]
struct PoolEffects {
    events: Vec<CoordinationEvent>,
    doomed: Vec<Doomed>,
    slot_freed: bool,
}

/// Outcome of one locked lookup. Hits and reservations carry guards so an
/// acquire dropped before it returns hands them back.
enum Checkout {
    Hit(PendingCheckout),
    Reserved {
        reservation: SlotReservation,
        entry_id: EntryId,
        pool_size: usize,
    },
    Exhausted { in_use: usize },
}

struct PoolInner {
    config: PoolConfig,
    clock: SharedClock,
    events: Arc<EventBus>,
    state: Mutex<PoolState>,
    slot_freed: Notify,
}

/// Bounded, TTL-tiered cache of specialists with usage-scored eviction.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct SpecialistPool {
    inner: Arc<PoolInner>,
}

impl SpecialistPool {
    /// Pool on the wall clock with a private event bus
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        Self::with_parts(config, SystemClock::shared(), EventBus::shared())
    }

    /// Fails when the pool config does not validate, e.g. a zero capacity
    pub fn with_parts(
        config: PoolConfig,
        clock: SharedClock,
        events: Arc<EventBus>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let usage = UsageTracker::new(clock.clone(), config.score_weights);
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                clock,
                events,
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    usage,
                    reserved: 0,
                    counters: PoolCounters::default(),
                    next_entry_id: 0,
                    acquire_seq: 0,
                }),
                slot_freed: Notify::new(),
            }),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Cached entries, in use or idle
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check out a specialist of `type_key`, constructing one with `factory`
    /// when no idle entry of that type is cached
    pub async fn acquire(
        &self,
        type_key: &str,
        factory: &dyn SpecialistFactory,
    ) -> PoolResult<SpecialistHandle> {
        let deadline = self
            .inner
            .config
            .acquire_timeout()
            .map(|timeout| self.inner.clock.now() + timeout);
        let mut first_attempt = true;

        let (reservation, entry_id, pool_size) = loop {
            let notified = self.inner.slot_freed.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a release in between wakes us.
            notified.as_mut().enable();

            let mut effects = PoolEffects::default();
            let checkout = {
                let mut state = self.inner.state.lock();
                let now = self.inner.clock.now();
                self.inner.purge_locked(&mut state, now, &mut effects);
                self.inner
                    .checkout_or_reserve(&mut state, type_key, first_attempt, &mut effects)
            };
            first_attempt = false;
            let destroy_failures = self.inner.settle(effects).await;
            for failure in destroy_failures {
                warn!(error = %failure, "destroy hook failed during eviction");
            }

            match checkout? {
                Checkout::Hit(pending) => return Ok(pending.deliver()),
                Checkout::Reserved {
                    reservation,
                    entry_id,
                    pool_size,
                } => break (reservation, entry_id, pool_size),
                Checkout::Exhausted { in_use } => {
                    let capacity = self.inner.config.capacity;
                    if self.inner.config.exhaustion_policy == ExhaustionPolicy::Fail {
                        warn!(type_key, capacity, in_use, "specialist pool exhausted");
                        return Err(PoolError::exhausted(capacity, in_use));
                    }

                    debug!(type_key, capacity, in_use, "specialist pool full, waiting for a slot");
                    match deadline {
                        None => notified.await,
                        Some(deadline) => {
                            tokio::select! {
                                _ = &mut notified => {}
                                _ = self.inner.clock.sleep_until(deadline) => {
                                    warn!(type_key, capacity, in_use, "timed out waiting for a pool slot");
                                    return Err(PoolError::exhausted(capacity, in_use));
                                }
                            }
                        }
                    }
                }
            }
        };

        let context = FactoryContext {
            type_key: type_key.to_string(),
            entry_id,
            pool_size,
            requested_at: Utc::now(),
        };

        let instance = match factory.create(&context).await {
            Ok(instance) => instance,
            Err(source) => {
                drop(reservation);
                self.inner.state.lock().counters.factory_failures += 1;
                warn!(type_key, error = %source, "specialist factory failed");
                return Err(PoolError::factory(type_key, source));
            }
        };

        let mut effects = PoolEffects::default();
        let handle = {
            let mut state = self.inner.state.lock();
            reservation.commit(&mut state);

            let mut entry = PoolEntry {
                id: entry_id,
                type_key: type_key.to_string(),
                instance,
                created_at: self.inner.clock.now(),
                lifecycle: LifecycleStateMachine::new(entry_id, type_key),
                in_use: false,
                acquire_seq: 0,
            };
            entry.transition(SpecialistState::Idle, "constructed", &mut effects)?;
            entry.transition(SpecialistState::Active, "checkout", &mut effects)?;
            entry.in_use = true;
            entry.acquire_seq = state.next_acquire_seq();
            state.usage.record_access(&entry_id);

            let handle = entry.handle(false);
            state.entries.insert(entry_id, entry);
            info!(type_key, entry = %entry_id, size = state.entries.len(), "specialist constructed");
            handle
        };
        self.inner.events.emit_all(effects.events);
        Ok(handle)
    }

    /// Return the most recently acquired in-use entry of `type_key` to the cache
    pub fn release(&self, type_key: &str) -> PoolResult<EntryId> {
        let mut effects = PoolEffects::default();
        let released = {
            let mut state = self.inner.state.lock();
            let entry_id = state
                .entries
                .values()
                .filter(|e| e.in_use && e.type_key == type_key)
                .max_by_key(|e| e.acquire_seq)
                .map(|e| e.id)
                .ok_or_else(|| PoolError::not_in_use(type_key))?;
            self.inner.check_in(&mut state, entry_id, &mut effects)?;
            entry_id
        };
        self.inner.settle_sync(effects);
        Ok(released)
    }

    /// Return exactly the entry behind `handle` to the cache
    pub fn release_handle(&self, handle: &SpecialistHandle) -> PoolResult<()> {
        let mut effects = PoolEffects::default();
        {
            let mut state = self.inner.state.lock();
            let in_use = state
                .entries
                .get(&handle.entry_id)
                .map_or(false, |e| e.in_use);
            if !in_use {
                return Err(PoolError::not_in_use(handle.type_key.as_str()));
            }
            self.inner.check_in(&mut state, handle.entry_id, &mut effects)?;
        }
        self.inner.settle_sync(effects);
        Ok(())
    }

    /// Drop a checked-out entry whose specialist failed and run its destroy hook
    pub async fn discard(&self, handle: &SpecialistHandle, reason: &str) -> PoolResult<()> {
        let mut effects = PoolEffects::default();
        {
            let mut state = self.inner.state.lock();
            let in_use = state
                .entries
                .get(&handle.entry_id)
                .map_or(false, |e| e.in_use);
            if !in_use {
                return Err(PoolError::not_in_use(handle.type_key.as_str()));
            }
            if let Some(mut entry) = state.entries.remove(&handle.entry_id) {
                state.usage.forget(&entry.id);
                entry.transition(SpecialistState::Failed, reason, &mut effects)?;
                entry.transition(SpecialistState::Destroyed, "discarded", &mut effects)?;
                warn!(type_key = %entry.type_key, entry = %entry.id, reason, "specialist discarded");
                effects.events.push(CoordinationEvent::PoolEviction {
                    type_key: entry.type_key.clone(),
                    entry_id: entry.id,
                    reason: EvictionReason::Failed,
                });
                effects.doomed.push(Doomed {
                    entry_id: entry.id,
                    type_key: entry.type_key,
                    instance: entry.instance,
                });
                effects.slot_freed = true;
            }
        }

        match self.inner.settle(effects).await.into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Destroy every entry, in use or not.
    ///
    /// All destroy hooks run; the first failure is returned after the last one.
    pub async fn clear(&self) -> PoolResult<usize> {
        let mut effects = PoolEffects::default();
        let destroyed = {
            let mut state = self.inner.state.lock();
            let entries: Vec<PoolEntry> = state.entries.drain().map(|(_, entry)| entry).collect();
            state.usage.clear();

            for mut entry in entries.into_iter() {
                let steps: &[SpecialistState] = if entry.in_use {
                    &[SpecialistState::Failed, SpecialistState::Destroyed]
                } else {
                    &[SpecialistState::Destroyed]
                };
                for next in steps {
                    if let Err(err) = entry.transition(*next, "cleared", &mut effects) {
                        warn!(entry = %entry.id, error = %err, "unexpected lifecycle state while clearing");
                    }
                }
                effects.events.push(CoordinationEvent::PoolEviction {
                    type_key: entry.type_key.clone(),
                    entry_id: entry.id,
                    reason: EvictionReason::Cleared,
                });
                effects.doomed.push(Doomed {
                    entry_id: entry.id,
                    type_key: entry.type_key,
                    instance: entry.instance,
                });
            }
            effects.slot_freed = true;
            effects.doomed.len()
        };
        info!(destroyed, "specialist pool cleared");

        match self.inner.settle(effects).await.into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(destroyed),
        }
    }

    /// Destroy idle entries older than their type's TTL tier; returns how many
    pub async fn purge_expired(&self) -> usize {
        let mut effects = PoolEffects::default();
        {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            self.inner.purge_locked(&mut state, now, &mut effects);
        }
        let purged = effects.doomed.len();
        for failure in self.inner.settle(effects).await {
            warn!(error = %failure, "destroy hook failed during expiry");
        }
        purged
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let in_use = state.in_use();
        let counters = &state.counters;
        let lookups = counters.hits + counters.misses;
        PoolStats {
            size: state.entries.len(),
            capacity: self.inner.config.capacity,
            in_use,
            idle: state.entries.len() - in_use,
            reserved: state.reserved,
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            expirations: counters.expirations,
            factory_failures: counters.factory_failures,
            destroy_failures: counters.destroy_failures,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                counters.hits as f64 / lookups as f64
            },
        }
    }

    /// Whether any entry of `type_key` is cached
    pub fn has_type(&self, type_key: &str) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .any(|e| e.type_key == type_key)
    }

    /// Lifecycle state of a cached entry
    pub fn entry_state(&self, entry_id: EntryId) -> Option<SpecialistState> {
        self.inner
            .state
            .lock()
            .entries
            .get(&entry_id)
            .map(|e| e.lifecycle.state())
    }

    /// Current usage score of a cached entry
    pub fn usage_score(&self, entry_id: EntryId) -> Option<UsageScore> {
        self.inner.state.lock().usage.score(&entry_id)
    }
}

impl fmt::Debug for SpecialistPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SpecialistPool")
            .field("capacity", &self.inner.config.capacity)
            .field("size", &state.entries.len())
            .field("reserved", &state.reserved)
            .finish()
    }
}

impl PoolInner {
    fn checkout_or_reserve(
        self: &Arc<Self>,
        state: &mut PoolState,
        type_key: &str,
        count_miss: bool,
        effects: &mut PoolEffects,
    ) -> PoolResult<Checkout> {
        // Most recently used idle entry of the type.
        let hit = state
            .entries
            .values()
            .filter(|e| !e.in_use && e.type_key == type_key)
            .max_by_key(|e| (state.usage.last_access(&e.id), e.id))
            .map(|e| e.id);

        if let Some(entry_id) = hit {
            let seq = state.next_acquire_seq();
            state.usage.record_access(&entry_id);
            state.counters.hits += 1;
            if let Some(entry) = state.entries.get_mut(&entry_id) {
                entry.transition(SpecialistState::Active, "checkout", effects)?;
                entry.in_use = true;
                entry.acquire_seq = seq;
                debug!(type_key, entry = %entry_id, "specialist pool hit");
                effects.events.push(CoordinationEvent::PoolHit {
                    type_key: type_key.to_string(),
                    entry_id,
                });
                return Ok(Checkout::Hit(PendingCheckout {
                    inner: self.clone(),
                    handle: entry.handle(true),
                    acquire_seq: seq,
                    armed: true,
                }));
            }
        }

        if count_miss {
            state.counters.misses += 1;
            debug!(type_key, "specialist pool miss");
            effects.events.push(CoordinationEvent::PoolMiss {
                type_key: type_key.to_string(),
            });
        }

        if state.entries.len() + state.reserved >= self.config.capacity {
            match self.pick_victim(state) {
                Some(victim) => self.evict(state, victim, effects)?,
                None => {
                    return Ok(Checkout::Exhausted {
                        in_use: state.in_use(),
                    })
                }
            }
        }

        state.reserved += 1;
        state.next_entry_id += 1;
        Ok(Checkout::Reserved {
            reservation: SlotReservation {
                inner: self.clone(),
                armed: true,
            },
            entry_id: EntryId::new(state.next_entry_id),
            pool_size: state.entries.len(),
        })
    }

    /// Lowest-scored idle entry; ties go to the oldest
    fn pick_victim(&self, state: &PoolState) -> Option<EntryId> {
        state
            .entries
            .values()
            .filter(|e| !e.in_use)
            .map(|e| {
                let score = state.usage.score(&e.id).map_or(f64::MIN, |s| s.value);
                (score, e.created_at, e.id)
            })
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.2.cmp(&b.2))
            })
            .map(|(_, _, id)| id)
    }

    fn evict(&self, state: &mut PoolState, victim: EntryId, effects: &mut PoolEffects) -> PoolResult<()> {
        let Some(mut entry) = state.entries.remove(&victim) else {
            return Ok(());
        };
        let score = state.usage.score(&victim);
        state.usage.forget(&victim);
        state.counters.evictions += 1;
        info!(
            type_key = %entry.type_key,
            entry = %victim,
            score = ?score.map(|s| s.value),
            "evicting specialist under capacity pressure"
        );
        entry.transition(SpecialistState::Destroyed, "evicted", effects)?;
        effects.events.push(CoordinationEvent::PoolEviction {
            type_key: entry.type_key.clone(),
            entry_id: victim,
            reason: EvictionReason::Capacity,
        });
        effects.doomed.push(Doomed {
            entry_id: victim,
            type_key: entry.type_key,
            instance: entry.instance,
        });
        Ok(())
    }

    fn purge_locked(&self, state: &mut PoolState, now: Instant, effects: &mut PoolEffects) {
        let expired: Vec<EntryId> = state
            .entries
            .values()
            .filter(|e| !e.in_use)
            .filter(|e| {
                let Some(ttl) = self.config.idle_ttl_for(&e.type_key) else {
                    return false;
                };
                let last = state.usage.last_access(&e.id).unwrap_or(e.created_at);
                now.saturating_duration_since(last) >= ttl
            })
            .map(|e| e.id)
            .collect();

        for entry_id in expired {
            let Some(mut entry) = state.entries.remove(&entry_id) else {
                continue;
            };
            state.usage.forget(&entry_id);
            state.counters.expirations += 1;
            debug!(type_key = %entry.type_key, entry = %entry_id, "specialist idle ttl expired");
            if let Err(err) = entry.transition(SpecialistState::Destroyed, "idle ttl expired", effects) {
                warn!(entry = %entry_id, error = %err, "unexpected lifecycle state while expiring");
            }
            effects.events.push(CoordinationEvent::PoolEviction {
                type_key: entry.type_key.clone(),
                entry_id,
                reason: EvictionReason::Expired,
            });
            effects.doomed.push(Doomed {
                entry_id,
                type_key: entry.type_key,
                instance: entry.instance,
            });
            effects.slot_freed = true;
        }
    }

    fn check_in(&self, state: &mut PoolState, entry_id: EntryId, effects: &mut PoolEffects) -> PoolResult<()> {
        state.usage.touch(&entry_id);
        let Some(entry) = state.entries.get_mut(&entry_id) else {
            return Ok(());
        };
        entry.transition(SpecialistState::Releasing, "release", effects)?;
        entry.transition(SpecialistState::Idle, "returned", effects)?;
        entry.in_use = false;
        debug!(type_key = %entry.type_key, entry = %entry_id, "specialist returned to pool");
        effects.slot_freed = true;
        Ok(())
    }

    /// Publish events and wake blocked acquirers; no destroy hooks pending
    fn settle_sync(&self, effects: PoolEffects) {
        self.events.emit_all(effects.events);
        if effects.slot_freed {
            self.slot_freed.notify_waiters();
        }
    }

    /// Publish events, wake blocked acquirers and run pending destroy hooks.
    /// Returns the destroy hook failures.
    async fn settle(&self, mut effects: PoolEffects) -> Vec<PoolError> {
        let doomed = std::mem::take(&mut effects.doomed);
        self.settle_sync(effects);

        let mut failures = Vec::new();
        for Doomed { entry_id, type_key, instance } in doomed {
            if let Err(source) = instance.shutdown().await {
                debug!(type_key = %type_key, entry = %entry_id, "specialist destroy hook failed");
                failures.push(PoolError::destroy(type_key, source));
            }
        }
        if !failures.is_empty() {
            self.state.lock().counters.destroy_failures += failures.len() as u64;
        }
        failures
    }
}

/// Slot held for a construction in flight; handed back if it never commits
struct SlotReservation {
    inner: Arc<PoolInner>,
    armed: bool,
}

impl SlotReservation {
    fn commit(mut self, state: &mut PoolState) {
        state.reserved = state.reserved.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.inner.state.lock();
                state.reserved = state.reserved.saturating_sub(1);
            }
            self.inner.slot_freed.notify_waiters();
        }
    }
}

/// Cache hit marked in use but not yet handed to the caller
struct PendingCheckout {
    inner: Arc<PoolInner>,
    handle: SpecialistHandle,
    acquire_seq: u64,
    armed: bool,
}

impl PendingCheckout {
    fn deliver(mut self) -> SpecialistHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for PendingCheckout {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let entry_id = self.handle.entry_id;
        let mut effects = PoolEffects::default();
        {
            let mut state = self.inner.state.lock();
            // Skip if a release by type key already returned it and someone else took it.
            let still_ours = state
                .entries
                .get(&entry_id)
                .map_or(false, |e| e.in_use && e.acquire_seq == self.acquire_seq);
            if !still_ours {
                return;
            }
            if let Err(err) = self.inner.check_in(&mut state, entry_id, &mut effects) {
                warn!(entry = %entry_id, error = %err, "failed to return undelivered specialist");
            }
        }
        debug!(type_key = %self.handle.type_key, entry = %entry_id, "acquire dropped before delivery, specialist returned");
        self.inner.settle_sync(effects);
    }
}
