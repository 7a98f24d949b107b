// Lanekeeper
//
// Coordination kernel for a prompt-routing framework: single-seat arbitration
// of a scarce premium lane with priority queueing, and a bounded pool of
// specialist workers with TTL tiers and usage-scored eviction.

// =================================================================
// Building blocks
// =================================================================

// Time
// Injectable clock for deadlines, aging, timeouts and recency
pub mod clock;

// Events
// Coordination events, the event bus and its subscribers
pub mod events;

// Priority Queue
// Waiting list ordered by priority band, then arrival
pub mod queue;

// Usage Tracking
// Access counts, recency and eviction scores
pub mod usage;

// Lifecycle
// Per-specialist state machine
pub mod lifecycle;

// =================================================================
// Coordination components
// =================================================================

// Exclusive Leases
pub mod lease;

// Specialist Pool
pub mod pool;

// Task Flow
// Lease, checkout, execute, release
pub mod coordinator;

// =================================================================
// Ambient
// =================================================================

pub mod config;
pub mod error;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ExhaustionPolicy, KernelConfig, LeaseConfig, LoggingConfig, PoolConfig};
pub use coordinator::{TaskCoordinator, TaskOutcome, TaskRequest};
pub use error::{
    ConfigError, CoordinationError, CoordinationResult, LeaseError, LeaseResult, LifecycleError,
    LifecycleResult, PoolError, PoolResult,
};
pub use events::{
    CoordinationEvent, EventBus, EventEnvelope, EventRecorder, EventSubscriber, EvictionReason,
    ReleaseReason,
};
pub use lease::{
    AcquireOptions, ExclusiveResourceManager, HolderHealthCheck, Lease, LeaseStatus, RequesterId,
};
pub use lifecycle::{LifecycleStateMachine, SpecialistState};
pub use pool::{
    factory_fn, EntryId, FactoryContext, PoolStats, Specialist, SpecialistFactory,
    SpecialistHandle, SpecialistPool, SpecialistTask,
};
pub use queue::{Priority, PriorityQueue, QueueTicket, SyncPriorityQueue};
pub use usage::{ScoreWeights, UsageScore, UsageTracker};
