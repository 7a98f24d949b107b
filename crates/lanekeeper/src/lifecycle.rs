// Specialist lifecycle management
//
// Every pooled specialist carries a state machine. The pool drives it through
// the steady cycle Idle -> Active -> Releasing -> Idle and the terminal paths
// Active -> Failed -> Destroyed and Idle -> Destroyed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::events::{CoordinationEvent, EventBus};
use crate::pool::EntryId;

const HISTORY_LIMIT: usize = 16;

/// States of a pooled specialist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistState {
    /// Constructed by the factory, not yet available
    Created,
    /// Cached and available for checkout
    Idle,
    /// Checked out by a caller
    Active,
    /// Being returned to the pool
    Releasing,
    /// Failed while checked out
    Failed,
    /// Removed from the pool; terminal
    Destroyed,
}

impl SpecialistState {
    /// Whether the transition table allows `self -> next`
    pub fn can_transition_to(self, next: SpecialistState) -> bool {
        use SpecialistState::*;
        matches!(
            (self, next),
            (Created, Idle)
                | (Idle, Active)
                | (Active, Releasing)
                | (Releasing, Idle)
                | (Active, Failed)
                | (Failed, Destroyed)
                | (Idle, Destroyed)
        )
    }

    /// Destroyed is the only state with no way out
    pub fn is_terminal(self) -> bool {
        self == SpecialistState::Destroyed
    }
}

impl fmt::Display for SpecialistState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpecialistState::Created => "created",
            SpecialistState::Idle => "idle",
            SpecialistState::Active => "active",
            SpecialistState::Releasing => "releasing",
            SpecialistState::Failed => "failed",
            SpecialistState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: SpecialistState,
    pub to: SpecialistState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// State machine for a single pooled specialist
#[derive(Debug)]
pub struct LifecycleStateMachine {
    entry_id: EntryId,
    type_key: String,
    state: SpecialistState,
    history: VecDeque<TransitionRecord>,
    events: Option<Arc<EventBus>>,
}

impl LifecycleStateMachine {
    /// Create a machine in the `Created` state
    pub fn new(entry_id: EntryId, type_key: impl Into<String>) -> Self {
        Self {
            entry_id,
            type_key: type_key.into(),
            state: SpecialistState::Created,
            history: VecDeque::new(),
            events: None,
        }
    }

    /// Publish every successful transition on `bus`.
    ///
    /// The pool leaves this unset and forwards transitions itself once its
    /// lock is released.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Current state
    pub fn state(&self) -> SpecialistState {
        self.state
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// Most recent transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Move to `next`, failing loudly if the table does not allow it
    pub fn transition(
        &mut self,
        next: SpecialistState,
        reason: impl Into<String>,
    ) -> LifecycleResult<TransitionRecord> {
        let reason = reason.into();
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                entry: self.entry_id,
                from: self.state,
                to: next,
                reason,
            });
        }

        let record = TransitionRecord {
            from: self.state,
            to: next,
            reason,
            at: Utc::now(),
        };
        debug!(
            entry = %self.entry_id,
            type_key = %self.type_key,
            from = %record.from,
            to = %record.to,
            reason = %record.reason,
            "specialist lifecycle transition"
        );

        self.state = next;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());

        if let Some(bus) = &self.events {
            bus.emit(self.event_for(&record));
        }

        Ok(record)
    }

    /// Event describing a transition of this machine
    pub fn event_for(&self, record: &TransitionRecord) -> CoordinationEvent {
        CoordinationEvent::LifecycleTransition {
            entry_id: self.entry_id,
            type_key: self.type_key.clone(),
            from: record.from,
            to: record.to,
            reason: record.reason.clone(),
        }
    }
}
