//! Error types for lease arbitration, the specialist pool and lifecycle misuse

use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::SpecialistState;
use crate::pool::EntryId;

/// Errors returned by the exclusive resource manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Release attempted by a requester that does not hold the lease
    #[error("requester {requester} does not hold the lease")]
    NotHolder { requester: String },

    /// Queued acquire exceeded its timeout
    #[error("requester {requester} timed out after {waited_ms} ms in the lease queue")]
    Timeout { requester: String, waited_ms: u64 },

    /// Queued acquire was cancelled before it was granted
    #[error("lease request from {requester} was cancelled")]
    Cancelled { requester: String },

    /// The requester already holds the lease or is already queued for it
    #[error("requester {requester} already holds or awaits the lease")]
    DuplicateRequest { requester: String },

    /// The lease was already freed, e.g. by expiry, and may now belong to someone else
    #[error("lease {lease_id} is no longer held")]
    StaleLease { lease_id: u64 },
}

/// Result type for lease operations
pub type LeaseResult<T> = Result<T, LeaseError>;

impl LeaseError {
    /// Create a not-holder error
    pub fn not_holder(requester: impl Into<String>) -> Self {
        Self::NotHolder { requester: requester.into() }
    }

    /// Create a timeout error
    pub fn timeout(requester: impl Into<String>, waited_ms: u64) -> Self {
        Self::Timeout { requester: requester.into(), waited_ms }
    }

    /// Create a cancellation error
    pub fn cancelled(requester: impl Into<String>) -> Self {
        Self::Cancelled { requester: requester.into() }
    }

    /// Create a duplicate request error
    pub fn duplicate(requester: impl Into<String>) -> Self {
        Self::DuplicateRequest { requester: requester.into() }
    }

    /// Create a stale-lease error
    pub fn stale(lease_id: u64) -> Self {
        Self::StaleLease { lease_id }
    }

    /// Whether waiting again may succeed.
    ///
    /// Timeouts and cancellations are transient; the other variants are caller bugs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}

/// Invalid lifecycle transition for a pooled specialist
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition from {from} to {to} for entry {entry} ({reason})")]
    InvalidTransition {
        entry: EntryId,
        from: SpecialistState,
        to: SpecialistState,
        reason: String,
    },
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors returned by the specialist pool
#[derive(Error, Debug)]
pub enum PoolError {
    /// Pool is at capacity and no entry can be evicted
    #[error("specialist pool exhausted: {in_use} of {capacity} entries in use")]
    Exhausted { capacity: usize, in_use: usize },

    /// The injected factory failed to construct a specialist
    #[error("factory for specialist `{type_key}` failed")]
    Factory {
        type_key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Release requested for a type (or handle) with no in-use entry
    #[error("no in-use specialist of type `{type_key}`")]
    NotInUse { type_key: String },

    /// A destroy hook failed while removing an entry
    #[error("destroy hook for specialist `{type_key}` failed")]
    Destroy {
        type_key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Create an exhaustion error
    pub fn exhausted(capacity: usize, in_use: usize) -> Self {
        Self::Exhausted { capacity, in_use }
    }

    /// Wrap a factory failure
    pub fn factory(type_key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Factory { type_key: type_key.into(), source }
    }

    /// Create a not-in-use error
    pub fn not_in_use(type_key: impl Into<String>) -> Self {
        Self::NotInUse { type_key: type_key.into() }
    }

    /// Wrap a destroy hook failure
    pub fn destroy(type_key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Destroy { type_key: type_key.into(), source }
    }

    /// Whether backing off and retrying may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create a validation error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Errors surfaced by the task coordinator
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The specialist itself failed while executing a task
    #[error("specialist `{specialist}` failed to execute task {task_id}")]
    Execution {
        specialist: String,
        task_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Result type for coordinator operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;
