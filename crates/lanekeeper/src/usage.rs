// Usage tracking for pooled specialists
//
// Records how often and how recently each key was accessed and derives the
// score used to pick eviction victims.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::ConfigError;

/// Weights of the usage score.
///
/// `score = frequency * ln(1 + access_count) - recency_per_sec * idle_seconds`
///
/// With non-negative weights the score can only grow with more accesses and
/// only shrink with more idle time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub frequency: f64,
    pub recency_per_sec: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            recency_per_sec: 0.05,
        }
    }
}

impl ScoreWeights {
    /// Pure LRU ordering
    pub fn recency_only() -> Self {
        Self { frequency: 0.0, recency_per_sec: 1.0 }
    }

    /// Pure LFU ordering
    pub fn frequency_only() -> Self {
        Self { frequency: 1.0, recency_per_sec: 0.0 }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = |w: f64| w.is_finite() && w >= 0.0;
        if !valid(self.frequency) || !valid(self.recency_per_sec) {
            return Err(ConfigError::invalid(
                "score weights must be finite and non-negative",
            ));
        }
        if self.frequency == 0.0 && self.recency_per_sec == 0.0 {
            return Err(ConfigError::invalid("at least one score weight must be positive"));
        }
        Ok(())
    }

    fn score(&self, access_count: u64, idle: Duration) -> f64 {
        self.frequency * (access_count as f64).ln_1p() - self.recency_per_sec * idle.as_secs_f64()
    }
}

/// Derived usage score of one key; higher is more valuable
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageScore {
    pub value: f64,
    pub access_count: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct UsageRecord {
    access_count: u64,
    first_access: Instant,
    last_access: Instant,
}

/// Per-key access counter with recency
#[derive(Debug)]
pub struct UsageTracker<K> {
    clock: SharedClock,
    weights: ScoreWeights,
    records: HashMap<K, UsageRecord>,
}

impl<K> UsageTracker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(clock: SharedClock, weights: ScoreWeights) -> Self {
        Self {
            clock,
            weights,
            records: HashMap::new(),
        }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    /// Count an access and refresh recency; returns the new access count
    pub fn record_access(&mut self, key: &K) -> u64 {
        let now = self.clock.now();
        let record = self.records.entry(key.clone()).or_insert(UsageRecord {
            access_count: 0,
            first_access: now,
            last_access: now,
        });
        record.access_count += 1;
        record.last_access = now;
        record.access_count
    }

    /// Refresh recency without counting an access. No-op for unknown keys.
    pub fn touch(&mut self, key: &K) {
        let now = self.clock.now();
        if let Some(record) = self.records.get_mut(key) {
            record.last_access = now;
        }
    }

    /// Current score of `key`
    pub fn score(&self, key: &K) -> Option<UsageScore> {
        let now = self.clock.now();
        self.records.get(key).map(|record| self.score_at(record, now))
    }

    /// Snapshot of every score, computed against a single instant
    pub fn all_scores(&self) -> HashMap<K, UsageScore> {
        let now = self.clock.now();
        self.records
            .iter()
            .map(|(key, record)| (key.clone(), self.score_at(record, now)))
            .collect()
    }

    pub fn access_count(&self, key: &K) -> u64 {
        self.records.get(key).map_or(0, |r| r.access_count)
    }

    pub fn last_access(&self, key: &K) -> Option<Instant> {
        self.records.get(key).map(|r| r.last_access)
    }

    pub fn first_access(&self, key: &K) -> Option<Instant> {
        self.records.get(key).map(|r| r.first_access)
    }

    /// Time since the last access or touch
    pub fn idle_for(&self, key: &K) -> Option<Duration> {
        let now = self.clock.now();
        self.records
            .get(key)
            .map(|r| now.saturating_duration_since(r.last_access))
    }

    /// Drop all bookkeeping for `key`
    pub fn forget(&mut self, key: &K) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn score_at(&self, record: &UsageRecord, now: Instant) -> UsageScore {
        let idle = now.saturating_duration_since(record.last_access);
        UsageScore {
            value: self.weights.score(record.access_count, idle),
            access_count: record.access_count,
            idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
